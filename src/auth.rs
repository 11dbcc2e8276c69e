//! Session-token authentication against the catalog's users.
//!
//! Sessions live in memory only. Expiry is detected lazily: the lookup that
//! finds an expired session removes it, there is no background sweeper.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::TryRngCore;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::{Result, WheelhouseError};
use crate::storage::User;

pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;
const TOKEN_BYTES: usize = 64;
const SALT_BYTES: usize = 16;

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Clone)]
struct Session {
    user: User,
    expires_at: DateTime<Utc>,
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Token handed out by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AuthService {
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl AuthService {
    pub fn new(catalog: Arc<dyn Catalog>, ttl: Duration) -> Self {
        Self::with_clock(catalog, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(catalog: Arc<dyn Catalog>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog,
            clock,
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Verify credentials and open a session.
    ///
    /// An unknown user and a wrong password both return
    /// [`WheelhouseError::CredentialInvalid`].
    pub async fn login_user(&self, username: &str, password: &str) -> Result<LoginGrant> {
        let Some(user) = self.catalog.get_user_by_username(username)? else {
            debug!(username, "Login for unknown user");
            return Err(WheelhouseError::CredentialInvalid);
        };

        let hash = user.password_hash.clone();
        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|err| {
                warn!(error = %err, "Password verification task failed");
                WheelhouseError::CredentialInvalid
            })?;
        if !verified {
            debug!(username, "Login with wrong password");
            return Err(WheelhouseError::CredentialInvalid);
        }

        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.ttl)
            .ok_or_else(|| {
                WheelhouseError::TokenGenerationFailed("session expiry is out of range".into())
            })?;
        let token = generate_session_token()?;
        self.sessions.write().insert(
            token.clone(),
            Session {
                user,
                expires_at,
            },
        );
        info!(username, %expires_at, "User logged in");

        Ok(LoginGrant { token, expires_at })
    }

    /// Drop the session; unknown tokens are ignored.
    pub fn logout_user(&self, token: &str) {
        if let Some(session) = self.sessions.write().remove(token) {
            info!(username = %session.user.username, "User logged out");
        }
    }

    pub fn get_session_user(&self, token: &str) -> Result<User> {
        let now = self.clock.now();
        {
            let sessions = self.sessions.read();
            match sessions.get(token) {
                None => return Err(WheelhouseError::NoValidSession),
                Some(session) if !session.is_expired(now) => return Ok(session.user.clone()),
                Some(_) => {}
            }
        }

        let mut sessions = self.sessions.write();
        if sessions.get(token).is_some_and(|s| s.is_expired(now)) {
            if let Some(session) = sessions.remove(token) {
                debug!(username = %session.user.username, "Removed expired session");
            }
        }
        Err(WheelhouseError::NoValidSession)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

fn verify_password(password: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "Stored password hash is malformed");
            return false;
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn generate_session_token() -> Result<String> {
    let mut token = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut token)
        .map_err(|err| WheelhouseError::TokenGenerationFailed(err.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(token))
}

/// Hash a password into an Argon2id PHC string for the catalog.
pub fn hash_password(password: &str) -> Result<String> {
    hash_password_with(&Argon2::default(), password)
}

fn hash_password_with(argon2: &Argon2<'_>, password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_BYTES];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|err| WheelhouseError::PasswordHash(err.to_string()))?;
    let salt = SaltString::encode_b64(&salt)
        .map_err(|err| WheelhouseError::PasswordHash(err.to_string()))?;
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| WheelhouseError::PasswordHash(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogSnapshot, MemoryCatalog};
    use argon2::{Algorithm, Params, Version};

    fn cheap_hash(password: &str) -> String {
        let params = Params::new(1024, 1, 1, None).unwrap();
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        hash_password_with(&argon2, password).unwrap()
    }

    fn user(username: &str, password: &str, roles: &[&str]) -> User {
        User {
            username: username.to_string(),
            password_hash: cheap_hash(password),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn service() -> (AuthService, Arc<ManualClock>) {
        let users = vec![
            user("testuser", "password", &["admin"]),
            User {
                username: "broken".to_string(),
                password_hash: "not-a-phc-string".to_string(),
                roles: vec![],
            },
        ];
        let catalog = Arc::new(MemoryCatalog::new(CatalogSnapshot::new(vec![], users)));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ttl = Duration::hours(DEFAULT_SESSION_TTL_HOURS);
        let auth = AuthService::with_clock(catalog, ttl, clock.clone());
        (auth, clock)
    }

    #[tokio::test]
    async fn login_returns_token_bound_to_user() {
        let (auth, clock) = service();
        let grant = auth.login_user("testuser", "password").await.unwrap();

        assert!(!grant.token.is_empty());
        assert_eq!(grant.expires_at, clock.now() + Duration::hours(24));
        let session_user = auth.get_session_user(&grant.token).unwrap();
        assert_eq!(session_user.username, "testuser");
        assert_eq!(session_user.roles, vec!["admin".to_string()]);
    }

    #[tokio::test]
    async fn bad_password_and_unknown_user_look_the_same() {
        let (auth, _) = service();
        let wrong = auth
            .login_user("testuser", "wrongpassword")
            .await
            .unwrap_err();
        let missing = auth.login_user("nobody", "password").await.unwrap_err();
        let broken = auth.login_user("broken", "password").await.unwrap_err();

        assert!(matches!(wrong, WheelhouseError::CredentialInvalid));
        assert!(matches!(missing, WheelhouseError::CredentialInvalid));
        assert!(matches!(broken, WheelhouseError::CredentialInvalid));
        assert_eq!(wrong.to_string(), missing.to_string());
        assert_eq!(auth.session_count(), 0);
    }

    #[tokio::test]
    async fn expired_session_is_rejected_and_removed() {
        let (auth, clock) = service();
        let grant = auth.login_user("testuser", "password").await.unwrap();

        clock.advance(Duration::hours(23));
        assert!(auth.get_session_user(&grant.token).is_ok());

        clock.advance(Duration::hours(1));
        assert!(matches!(
            auth.get_session_user(&grant.token),
            Err(WheelhouseError::NoValidSession)
        ));
        assert_eq!(auth.session_count(), 0);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let (auth, _) = service();
        let grant = auth.login_user("testuser", "password").await.unwrap();

        auth.logout_user("no-such-token");
        assert_eq!(auth.session_count(), 1);

        auth.logout_user(&grant.token);
        auth.logout_user(&grant.token);
        assert!(matches!(
            auth.get_session_user(&grant.token),
            Err(WheelhouseError::NoValidSession)
        ));
    }

    #[tokio::test]
    async fn every_login_gets_a_fresh_token() {
        let (auth, _) = service();
        let a = auth.login_user("testuser", "password").await.unwrap();
        let b = auth.login_user("testuser", "password").await.unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(auth.session_count(), 2);
        // 64 random bytes, unpadded base64.
        assert_eq!(a.token.len(), 86);
    }

    #[tokio::test]
    async fn login_with_unavailable_catalog_propagates() {
        let auth = AuthService::new(Arc::new(MemoryCatalog::unavailable()), Duration::hours(1));
        assert!(matches!(
            auth.login_user("testuser", "password").await,
            Err(WheelhouseError::ConfigUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn overflowing_expiry_fails_login_without_session() {
        let users = vec![user("testuser", "password", &[])];
        let catalog = Arc::new(MemoryCatalog::new(CatalogSnapshot::new(vec![], users)));
        let auth = AuthService::new(catalog, Duration::MAX);

        assert!(matches!(
            auth.login_user("testuser", "password").await,
            Err(WheelhouseError::TokenGenerationFailed(_))
        ));
        assert_eq!(auth.session_count(), 0);
    }

    #[test]
    fn hash_password_produces_verifiable_phc_string() {
        let hash = cheap_hash("s3cret");
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("other", &hash));
    }

    #[test]
    fn default_hash_uses_distinct_salts() {
        let a = hash_password("s3cret").unwrap();
        let b = hash_password("s3cret").unwrap();
        assert_ne!(a, b);
        assert!(verify_password("s3cret", &a));
    }
}
