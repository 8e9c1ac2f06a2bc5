//! Bearer-token codec.
//!
//! Access tokens live 60 minutes, refresh tokens 7 days; both carry a
//! `jti` so revocation works by id with TTL = remaining lifetime. Refresh
//! is rotation: verifying a refresh token and minting a new pair revokes
//! the old refresh `jti` in the same flow (see `service::refresh`).

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use aegis_types::{FirmRole, PrincipalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenUse {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id.
    pub sub: Uuid,
    pub kind: PrincipalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firm_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<FirmRole>,
    pub perms: Vec<String>,
    pub jti: Uuid,
    pub token_use: TokenUse,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }

    pub fn has_permission(&self, perm: &str) -> bool {
        self.perms.iter().any(|p| p == perm || p == "admin:*")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
    #[error("wrong token use")]
    WrongUse,
}

/// Permission set derived from the principal's kind and firm role.
pub fn permissions_for(kind: PrincipalKind, role: Option<FirmRole>) -> Vec<String> {
    let perms: &[&str] = match kind {
        PrincipalKind::PlatformAdmin => &["admin:*"],
        PrincipalKind::EndUser => &["panic:create", "group:manage", "subscription:manage"],
        PrincipalKind::FirmMember => match role {
            Some(r) if r.is_office_staff() => {
                &["request:view", "request:allocate", "request:cancel", "firm:manage"]
            }
            _ => &["request:view", "request:progress"],
        },
    };
    perms.iter().map(|s| s.to_string()).collect()
}

pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_lifetime: Duration,
    refresh_lifetime: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, access_lifetime: Duration, refresh_lifetime: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_lifetime,
            refresh_lifetime,
        }
    }

    pub fn from_settings(s: &aegis_config::Settings) -> Self {
        Self::new(
            &s.tokens.signing_secret,
            Duration::minutes(s.tokens.access_lifetime_minutes),
            Duration::days(s.tokens.refresh_lifetime_days),
        )
    }

    /// Mint an access + refresh pair with fresh `jti`s.
    pub fn mint_pair(
        &self,
        principal_id: Uuid,
        kind: PrincipalKind,
        firm_id: Option<Uuid>,
        role: Option<FirmRole>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TokenPair> {
        let perms = permissions_for(kind, role);
        let access_exp = now + self.access_lifetime;
        let refresh_exp = now + self.refresh_lifetime;

        let access = self.encode(&Claims {
            sub: principal_id,
            kind,
            firm_id,
            role,
            perms: perms.clone(),
            jti: Uuid::new_v4(),
            token_use: TokenUse::Access,
            iat: now.timestamp(),
            exp: access_exp.timestamp(),
        })?;
        let refresh = self.encode(&Claims {
            sub: principal_id,
            kind,
            firm_id,
            role,
            perms,
            jti: Uuid::new_v4(),
            token_use: TokenUse::Refresh,
            iat: now.timestamp(),
            exp: refresh_exp.timestamp(),
        })?;

        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            access_expires_at: access_exp,
            refresh_expires_at: refresh_exp,
        })
    }

    fn encode(&self, claims: &Claims) -> anyhow::Result<String> {
        encode(&Header::default(), claims, &self.encoding)
            .map_err(|e| anyhow::anyhow!("token encoding failed: {e}"))
    }

    /// Decode + validate signature and expiry, and check the token is of
    /// the expected use.
    pub fn verify(&self, token: &str, expected: TokenUse) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default()).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            },
        )?;
        if data.claims.token_use != expected {
            return Err(TokenError::WrongUse);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret", Duration::minutes(60), Duration::days(7))
    }

    #[test]
    fn mint_and_verify_access() {
        let s = signer();
        let id = Uuid::new_v4();
        let pair = s
            .mint_pair(id, PrincipalKind::EndUser, None, None, Utc::now())
            .unwrap();
        let claims = s.verify(&pair.access_token, TokenUse::Access).unwrap();
        assert_eq!(claims.sub, id);
        assert!(claims.has_permission("panic:create"));
        assert!(!claims.has_permission("request:allocate"));
    }

    #[test]
    fn refresh_token_rejected_on_access_path() {
        let s = signer();
        let pair = s
            .mint_pair(Uuid::new_v4(), PrincipalKind::EndUser, None, None, Utc::now())
            .unwrap();
        assert_eq!(
            s.verify(&pair.refresh_token, TokenUse::Access).unwrap_err(),
            TokenError::WrongUse
        );
    }

    #[test]
    fn expired_token_reports_expired() {
        let s = signer();
        let past = Utc::now() - Duration::hours(3);
        let pair = s
            .mint_pair(Uuid::new_v4(), PrincipalKind::EndUser, None, None, past)
            .unwrap();
        assert_eq!(
            s.verify(&pair.access_token, TokenUse::Access).unwrap_err(),
            TokenError::Expired
        );
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let a = signer();
        let b = TokenSigner::new("other-secret", Duration::minutes(60), Duration::days(7));
        let pair = a
            .mint_pair(Uuid::new_v4(), PrincipalKind::EndUser, None, None, Utc::now())
            .unwrap();
        assert_eq!(
            b.verify(&pair.access_token, TokenUse::Access).unwrap_err(),
            TokenError::Invalid
        );
    }

    #[test]
    fn office_staff_permissions() {
        let claims_perms = permissions_for(
            PrincipalKind::FirmMember,
            Some(FirmRole::FirmSupervisor),
        );
        assert!(claims_perms.contains(&"request:allocate".to_string()));
        let field = permissions_for(PrincipalKind::FirmMember, Some(FirmRole::FieldAgent));
        assert!(!field.contains(&"request:allocate".to_string()));
        assert!(field.contains(&"request:progress".to_string()));
    }

    #[test]
    fn admin_wildcard() {
        let s = signer();
        let pair = s
            .mint_pair(Uuid::new_v4(), PrincipalKind::PlatformAdmin, None, None, Utc::now())
            .unwrap();
        let claims = s.verify(&pair.access_token, TokenUse::Access).unwrap();
        assert!(claims.has_permission("anything:at_all"));
    }
}
