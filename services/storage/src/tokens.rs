use crate::config::AuthConfig;
use crate::error::{Error, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// What a token may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Authenticates API requests
    Access,
    /// Confirms ownership of an email address
    Verify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and checks bearer tokens
pub trait TokenService: Send + Sync {
    fn issue(&self, user_id: Uuid, username: &str, kind: TokenKind) -> Result<String>;

    /// Decode `token` and check its signature and expiry
    fn verify(&self, token: &str) -> Result<Claims>;
}

/// HS256 JWTs signed with a shared secret
pub struct JwtTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    verify_ttl: Duration,
}

impl JwtTokenService {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            access_ttl: config.access_token_ttl(),
            verify_ttl: config.verify_token_ttl(),
        }
    }

    fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Verify => self.verify_ttl,
        }
    }
}

impl TokenService for JwtTokenService {
    fn issue(&self, user_id: Uuid, username: &str, kind: TokenKind) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            kind,
            iat,
            exp: iat + self.ttl(kind).as_secs() as i64,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("failed to sign token: {e}")))
    }

    fn verify(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Unauthorized(format!("invalid token: {e}")))
    }
}
