//! Unlock-OTP code generation and digesting.
//!
//! The plaintext code exists only long enough to hand to the delivery
//! channel; the store keeps a SHA-256 digest.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Cryptographically random 6-digit code, zero-padded.
pub fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{n:06}")
}

/// Stored form of a code.
pub fn digest_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn digest_is_deterministic_and_hex() {
        let a = digest_code("123456");
        let b = digest_code("123456");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, digest_code("123457"));
    }
}
