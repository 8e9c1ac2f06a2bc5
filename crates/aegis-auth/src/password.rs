//! Password hashing (argon2id) and server-side policy validation.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Hash with argon2id and a fresh random salt.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a candidate against a stored hash. A malformed stored hash
/// verifies as false rather than erroring: the caller treats it like a
/// wrong password and the operator finds the corruption in the logs.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!("stored password hash failed to parse: {e}");
            false
        }
    }
}

/// Policy: ≥8 chars, at least one lowercase, one uppercase, one digit, one
/// special character. Returns the full violation list so clients can show
/// everything at once.
pub fn validate_password_policy(password: &str) -> Vec<&'static str> {
    let mut violations = Vec::new();
    if password.chars().count() < 8 {
        violations.push("must be at least 8 characters");
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        violations.push("must contain a lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        violations.push("must contain an uppercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push("must contain a digit");
    }
    if !password.chars().any(|c| !c.is_ascii_alphanumeric()) {
        violations.push("must contain a special character");
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("Str0ng!pass").unwrap();
        assert!(verify_password("Str0ng!pass", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn salts_differ() {
        let a = hash_password("Str0ng!pass").unwrap();
        let b = hash_password("Str0ng!pass").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_stored_hash_verifies_false() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn policy_catches_each_class() {
        assert!(validate_password_policy("Str0ng!pass").is_empty());
        assert!(validate_password_policy("short")
            .contains(&"must be at least 8 characters"));
        assert!(validate_password_policy("alllower1!")
            .contains(&"must contain an uppercase letter"));
        assert!(validate_password_policy("ALLUPPER1!")
            .contains(&"must contain a lowercase letter"));
        assert!(validate_password_policy("NoDigits!!")
            .contains(&"must contain a digit"));
        assert!(validate_password_policy("NoSpecial1")
            .contains(&"must contain a special character"));
    }
}
