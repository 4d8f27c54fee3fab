//! Signed access token values (HS256 JWTs).
//!
//! The claims name the token row, the agent and the user it was minted for,
//! and its expiry. Revocation and unknown tokens are checked against the
//! stored row by the caller.

use crate::error::{RegistryError, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(rename = "tid")]
    pub token_id: String,
    #[serde(rename = "aid")]
    pub agent_id: String,
    #[serde(rename = "sub")]
    pub user_id: String,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn sign(
        &self,
        token_id: &str,
        agent_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        let claims = TokenClaims {
            token_id: token_id.to_string(),
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            exp: expires_at.timestamp(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding,
        )?)
    }

    /// Checks signature and expiry, then decodes the claims.
    pub fn verify(&self, value: &str) -> Result<TokenClaims> {
        jsonwebtoken::decode::<TokenClaims>(value, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "token has expired",
                    ErrorKind::InvalidSignature => "invalid token signature",
                    _ => "malformed token",
                };
                RegistryError::Unauthorized(reason.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn unauthorized(result: Result<TokenClaims>) -> String {
        match result {
            Err(RegistryError::Unauthorized(msg)) => msg,
            other => panic!("expected Unauthorized, got {other:?}"),
        }
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = TokenSigner::new("test-secret");
        let expires_at = Utc::now() + Duration::days(30);
        let value = signer.sign("t1", "a1", "u1", expires_at).unwrap();

        let claims = signer.verify(&value).unwrap();
        assert_eq!(claims.token_id, "t1");
        assert_eq!(claims.agent_id, "a1");
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.exp, expires_at.timestamp());
    }

    #[test]
    fn test_rejects_other_secret_and_tampering() {
        let signer = TokenSigner::new("test-secret");
        let expires_at = Utc::now() + Duration::days(1);
        let value = signer.sign("t1", "a1", "u1", expires_at).unwrap();

        let other = TokenSigner::new("another-secret");
        assert_eq!(unauthorized(other.verify(&value)), "invalid token signature");

        let foreign = signer.sign("t2", "a2", "u1", expires_at).unwrap();
        let parts: Vec<&str> = value.split('.').collect();
        let foreign_parts: Vec<&str> = foreign.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], foreign_parts[1], parts[2]);
        assert_eq!(unauthorized(signer.verify(&forged)), "invalid token signature");

        assert_eq!(unauthorized(signer.verify("no-dot-here")), "malformed token");
    }

    #[test]
    fn test_rejects_expired() {
        let signer = TokenSigner::new("test-secret");
        let value = signer
            .sign("t1", "a1", "u1", Utc::now() - Duration::days(1))
            .unwrap();
        assert_eq!(unauthorized(signer.verify(&value)), "token has expired");
    }
}
