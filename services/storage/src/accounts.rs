use crate::error::{Error, Result};
use crate::metadata_store::MetadataStore;
use crate::models::{now, User};
use crate::notifier::{dispatch, Notification, Notifier};
use crate::object_store::is_valid_path_component;
use crate::tokens::{TokenKind, TokenService};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Registration, email verification and login
pub struct AccountService {
    store: Arc<dyn MetadataStore>,
    tokens: Arc<dyn TokenService>,
    notifier: Arc<dyn Notifier>,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        tokens: Arc<dyn TokenService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            tokens,
            notifier,
        }
    }

    /// Create an unverified user and send them a verification token
    #[instrument(skip_all, fields(username = %request.username))]
    pub async fn register(&self, request: RegisterRequest) -> Result<User> {
        let username = request.username.trim();
        let email = request.email.trim();

        if username.is_empty() || email.is_empty() || request.password.is_empty() {
            return Err(Error::invalid("username, email and password are required"));
        }

        // The username is the object key prefix and must be stored unaltered
        if !is_valid_path_component(username) {
            return Err(Error::invalid(
                "username may only contain letters, digits, '.', '-' and '_'",
            ));
        }

        let password = request.password;
        let password_hash = task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| Error::Internal(format!("password hashing task failed: {e}")))??;

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            verified: false,
            created_at: now(),
        };
        self.store.insert_user(&user).await?;

        let token = self
            .tokens
            .issue(user.id, &user.username, TokenKind::Verify)?;
        dispatch(
            self.notifier.clone(),
            Notification {
                kind: "verify".to_string(),
                receiver: user.email.clone(),
                subject: "Verify your email".to_string(),
                username: user.username.clone(),
                token,
            },
        );

        metrics::counter!("photos.users.registered").increment(1);
        info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    /// Mark the token's user verified. Verifying twice is harmless.
    #[instrument(skip_all)]
    pub async fn verify(&self, token: &str) -> Result<()> {
        let claims = self.tokens.verify(token)?;
        if claims.kind != TokenKind::Verify {
            return Err(Error::Unauthorized("not a verification token".to_string()));
        }

        if !self.store.mark_user_verified(claims.sub).await? {
            return Err(Error::not_found("user", claims.sub));
        }

        info!(user_id = %claims.sub, "User verified");
        Ok(())
    }

    /// Exchange credentials for an access token
    #[instrument(skip_all)]
    pub async fn login(&self, request: LoginRequest) -> Result<String> {
        let invalid = || Error::Unauthorized("invalid email or password".to_string());

        let user = self
            .store
            .get_user_by_email(request.email.trim())
            .await?
            .ok_or_else(invalid)?;

        let password = request.password;
        let password_hash = user.password_hash.clone();
        let matches = task::spawn_blocking(move || verify_password(&password, &password_hash))
            .await
            .map_err(|e| Error::Internal(format!("password verification task failed: {e}")))??;

        if !matches {
            return Err(invalid());
        }

        self.tokens
            .issue(user.id, &user.username, TokenKind::Access)
    }
}

/// Hash a password with Argon2id and a random salt
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("failed to hash password: {e}")))
}

fn verify_password(password: &str, password_hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|e| Error::Internal(format!("invalid password hash format: {e}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::notifier::TracingNotifier;
    use crate::testing::MemoryMetadataStore;
    use crate::tokens::JwtTokenService;
    use tokio_test::{assert_err, assert_ok};

    fn tokens() -> Arc<JwtTokenService> {
        Arc::new(JwtTokenService::new(&AuthConfig {
            jwt_secret: "secret".to_string(),
            access_token_ttl_secs: 3600,
            verify_token_ttl_secs: 600,
        }))
    }

    fn service(store: Arc<MemoryMetadataStore>, tokens: Arc<JwtTokenService>) -> AccountService {
        AccountService::new(store, tokens, Arc::new(TracingNotifier))
    }

    fn register_request() -> RegisterRequest {
        RegisterRequest {
            username: "u1".to_string(),
            email: "u1@example.com".to_string(),
            password: "hunter22".to_string(),
        }
    }

    #[test]
    fn test_password_hash_round_trip() {
        let hash = hash_password("hunter22").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter22", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[tokio::test]
    async fn test_register_verify_login() {
        let store = Arc::new(MemoryMetadataStore::new());
        let tokens = tokens();
        let accounts = service(store.clone(), tokens.clone());

        let user = accounts.register(register_request()).await.unwrap();
        assert!(!user.verified);
        assert_ne!(user.password_hash, "hunter22");

        let verify_token = tokens.issue(user.id, "u1", TokenKind::Verify).unwrap();
        assert_ok!(accounts.verify(&verify_token).await);
        assert_ok!(accounts.verify(&verify_token).await);
        assert!(store.get_user(user.id).await.unwrap().unwrap().verified);

        let access = accounts
            .login(LoginRequest {
                email: "u1@example.com".to_string(),
                password: "hunter22".to_string(),
            })
            .await
            .unwrap();
        let claims = tokens.verify(&access).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.kind, TokenKind::Access);
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let accounts = service(Arc::new(MemoryMetadataStore::new()), tokens());
        assert_ok!(accounts.register(register_request()).await);

        let err = accounts.register(register_request()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_blank_fields_rejected() {
        let accounts = service(Arc::new(MemoryMetadataStore::new()), tokens());
        let err = accounts
            .register(RegisterRequest {
                username: " ".to_string(),
                ..register_request()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_username_outside_key_alphabet_rejected() {
        let store = Arc::new(MemoryMetadataStore::new());
        let accounts = service(store.clone(), tokens());

        for (i, username) in ["a b", "a/b", "..", "é"].into_iter().enumerate() {
            let err = accounts
                .register(RegisterRequest {
                    username: username.to_string(),
                    email: format!("user{i}@example.com"),
                    ..register_request()
                })
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{username}");
        }

        let user = accounts
            .register(RegisterRequest {
                username: "a_b".to_string(),
                ..register_request()
            })
            .await
            .unwrap();
        assert_eq!(user.username, "a_b");
        assert!(store.get_user(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_password_unauthorized() {
        let accounts = service(Arc::new(MemoryMetadataStore::new()), tokens());
        accounts.register(register_request()).await.unwrap();

        let err = accounts
            .login(LoginRequest {
                email: "u1@example.com".to_string(),
                password: "nope".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        assert_err!(
            accounts
                .login(LoginRequest {
                    email: "nobody@example.com".to_string(),
                    password: "hunter22".to_string(),
                })
                .await
        );
    }

    #[tokio::test]
    async fn test_access_token_cannot_verify() {
        let store = Arc::new(MemoryMetadataStore::new());
        let tokens = tokens();
        let accounts = service(store, tokens.clone());
        let user = accounts.register(register_request()).await.unwrap();

        let access = tokens.issue(user.id, "u1", TokenKind::Access).unwrap();
        assert!(matches!(
            accounts.verify(&access).await,
            Err(Error::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_unknown_user_not_found() {
        let tokens = tokens();
        let accounts = service(Arc::new(MemoryMetadataStore::new()), tokens.clone());
        let token = tokens.issue(Uuid::new_v4(), "ghost", TokenKind::Verify).unwrap();

        assert!(matches!(
            accounts.verify(&token).await,
            Err(Error::NotFound { entity: "user", .. })
        ));
    }
}
