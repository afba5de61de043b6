//! Shared-secret (HS256) JWT verification.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::provider::{AuthProvider, AuthenticatedUser};
use crate::error::{CarepayError, Result};
use crate::utils::get_env_with_prefix;

const TARGET: &str = "carepay::security";

/// Shortest accepted HS256 secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Claims carried by an access token. `sub` is the user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Token verification settings.
#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: SecretString,
    /// Required `iss` claim, when set.
    pub issuer: Option<String>,
    /// Required `aud` claim, when set.
    pub audience: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"[REDACTED]")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

impl AuthConfig {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: SecretString::from(jwt_secret.into()),
            issuer: None,
            audience: None,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Load from `CAREPAY_AUTH_JWT_SECRET`, `CAREPAY_AUTH_JWT_ISSUER` and
    /// `CAREPAY_AUTH_JWT_AUDIENCE`. `None` without a secret.
    pub fn from_env() -> Option<Self> {
        let mut config = Self::new(get_env_with_prefix("AUTH_JWT_SECRET")?);
        config.issuer = get_env_with_prefix("AUTH_JWT_ISSUER");
        config.audience = get_env_with_prefix("AUTH_JWT_AUDIENCE");
        Some(config)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.jwt_secret.expose_secret().len() < MIN_SECRET_LEN {
            return Err(format!(
                "auth JWT secret must be at least {} bytes",
                MIN_SECRET_LEN
            ));
        }
        Ok(())
    }
}

/// [`AuthProvider`] for HS256 tokens signed with a shared secret.
#[derive(Clone)]
pub struct JwtAuthProvider {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwtAuthProvider {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.expose_secret().as_bytes();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
        }
    }

    /// Verify signature, expiry and the configured issuer and audience.
    pub fn verify(&self, token: &str) -> Result<AuthClaims> {
        let data = decode::<AuthClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            tracing::debug!(target: TARGET, error = %e, "Rejected bearer token");
            CarepayError::unauthorized("Invalid or expired token")
        })?;

        if data.claims.sub.trim().is_empty() {
            return Err(CarepayError::unauthorized("Token has no subject"));
        }
        Ok(data.claims)
    }

    /// Sign a token for `user_id` that expires after `ttl`.
    pub fn issue(&self, user_id: &str, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = AuthClaims {
            sub: user_id.to_string(),
            exp: (now + ttl).timestamp(),
            iat: Some(now.timestamp()),
            email: None,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| CarepayError::internal(format!("Failed to sign token: {}", e)))
    }
}

#[async_trait]
impl AuthProvider for JwtAuthProvider {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser> {
        let claims = self.verify(token)?;
        Ok(AuthenticatedUser {
            user_id: claims.sub,
            email: claims.email,
        })
    }
}
