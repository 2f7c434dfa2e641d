//! Worker token issuance and validation.
//!
//! Worker tokens are HS256-signed JWTs carrying a [`WorkerClaims`] payload.
//! They hold no server-side state: validity is the signature plus expiry.
//! There is no revocation list.

use flowgate_core::config::{parse_or, required, ConfigError};
use flowgate_core::worker::{WorkerIdentity, WorkerMachineType};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value of the `typ` claim on worker tokens.
pub const WORKER_TOKEN_TYPE: &str = "WORKER";

/// Default worker token expiry in days.
const DEFAULT_WORKER_EXPIRY_DAYS: i64 = 7;

/// JWT claims embedded in every worker token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerClaims {
    /// Subject, e.g. `worker:SHARED`.
    pub sub: String,
    pub machine_type: WorkerMachineType,
    pub platform_id: Option<String>,
    /// Token kind; always [`WORKER_TOKEN_TYPE`].
    pub typ: String,
    /// Expiration time (UTC Unix timestamp).
    pub exp: i64,
    /// Issued-at time (UTC Unix timestamp).
    pub iat: i64,
    /// Unique token identifier for audit.
    pub jti: String,
}

impl WorkerClaims {
    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity {
            machine_type: self.machine_type,
            platform_id: self.platform_id.clone(),
        }
    }
}

/// Configuration for worker token signing and validation.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// HMAC-SHA256 secret used to sign and verify tokens.
    pub secret: String,
    /// Worker token lifetime in days (default: 7).
    pub worker_token_expiry_days: i64,
}

impl JwtConfig {
    /// Load JWT configuration from an environment lookup.
    ///
    /// | Env Var                    | Required | Default |
    /// |----------------------------|----------|---------|
    /// | `JWT_SECRET`               | **yes**  | --      |
    /// | `WORKER_TOKEN_EXPIRY_DAYS` | no       | `7`     |
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secret = required(lookup, "JWT_SECRET")?;
        let worker_token_expiry_days: i64 =
            parse_or(lookup, "WORKER_TOKEN_EXPIRY_DAYS", DEFAULT_WORKER_EXPIRY_DAYS)?;
        if worker_token_expiry_days <= 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_TOKEN_EXPIRY_DAYS",
                value: worker_token_expiry_days.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            secret,
            worker_token_expiry_days,
        })
    }
}

/// Mint an HS256 token authorizing `identity` to pull jobs.
pub fn issue_worker_token(
    identity: &WorkerIdentity,
    config: &JwtConfig,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now().timestamp();
    let exp = now + config.worker_token_expiry_days * 24 * 60 * 60;

    let claims = WorkerClaims {
        sub: identity.subject(),
        machine_type: identity.machine_type,
        platform_id: identity.platform_id.clone(),
        typ: WORKER_TOKEN_TYPE.to_string(),
        exp,
        iat: now,
        jti: Uuid::new_v4().to_string(),
    };

    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
}

/// Validate a worker token's signature, expiry and type.
pub fn validate_worker_token(
    token: &str,
    config: &JwtConfig,
) -> Result<WorkerClaims, jsonwebtoken::errors::Error> {
    let token_data = decode::<WorkerClaims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &Validation::default(), // HS256, validates exp
    )?;

    if token_data.claims.typ != WORKER_TOKEN_TYPE {
        return Err(ErrorKind::InvalidToken.into());
    }
    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn test_config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret-that-is-long-enough-for-hmac".to_string(),
            worker_token_expiry_days: 7,
        }
    }

    fn sign(claims: &WorkerClaims, config: &JwtConfig) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(config.secret.as_bytes()),
        )
        .expect("encoding should succeed")
    }

    #[test]
    fn issued_shared_token_validates() {
        let config = test_config();
        let token = issue_worker_token(&WorkerIdentity::shared(), &config).unwrap();

        let claims = validate_worker_token(&token, &config).unwrap();
        assert_eq!(claims.sub, "worker:SHARED");
        assert_eq!(claims.typ, WORKER_TOKEN_TYPE);
        assert_eq!(claims.identity(), WorkerIdentity::shared());
        assert_eq!(claims.exp - claims.iat, 7 * 24 * 60 * 60);
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn dedicated_token_keeps_platform() {
        let config = test_config();
        let identity = WorkerIdentity::dedicated("plat_1");
        let token = issue_worker_token(&identity, &config).unwrap();

        let claims = validate_worker_token(&token, &config).unwrap();
        assert_eq!(claims.identity(), identity);
    }

    #[test]
    fn each_token_has_unique_id() {
        let config = test_config();
        let a = issue_worker_token(&WorkerIdentity::shared(), &config).unwrap();
        let b = issue_worker_token(&WorkerIdentity::shared(), &config).unwrap();
        let a = validate_worker_token(&a, &config).unwrap();
        let b = validate_worker_token(&b, &config).unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn expired_token_fails() {
        let config = test_config();
        let now = chrono::Utc::now().timestamp();
        let claims = WorkerClaims {
            sub: "worker:SHARED".to_string(),
            machine_type: WorkerMachineType::Shared,
            platform_id: None,
            typ: WORKER_TOKEN_TYPE.to_string(),
            exp: now - 300, // well past the default leeway
            iat: now - 600,
            jti: Uuid::new_v4().to_string(),
        };

        let err = validate_worker_token(&sign(&claims, &config), &config).unwrap_err();
        assert_matches!(err.kind(), ErrorKind::ExpiredSignature);
    }

    #[test]
    fn wrong_token_type_fails() {
        let config = test_config();
        let now = chrono::Utc::now().timestamp();
        let claims = WorkerClaims {
            sub: "worker:SHARED".to_string(),
            machine_type: WorkerMachineType::Shared,
            platform_id: None,
            typ: "USER".to_string(),
            exp: now + 300,
            iat: now,
            jti: Uuid::new_v4().to_string(),
        };

        let err = validate_worker_token(&sign(&claims, &config), &config).unwrap_err();
        assert_matches!(err.kind(), ErrorKind::InvalidToken);
    }

    #[test]
    fn different_secrets_fail() {
        let token = issue_worker_token(&WorkerIdentity::shared(), &test_config()).unwrap();
        let other = JwtConfig {
            secret: "secret-bravo".to_string(),
            worker_token_expiry_days: 7,
        };
        assert!(validate_worker_token(&token, &other).is_err());
    }

    #[test]
    fn missing_secret_is_config_error() {
        let env: HashMap<&str, &str> = HashMap::new();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());
        assert_matches!(
            JwtConfig::from_lookup(&lookup),
            Err(ConfigError::Missing("JWT_SECRET"))
        );
    }
}
