use std::{sync::Arc, time::Duration};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        jwt::JwtKeys,
        password::{hash_password, verify_password},
        repo_types::{PublicUser, UserRecord},
    },
    error::AppError,
    store::{with_deadline, UserStore},
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

// Emails are trimmed before use, so blank ones are missing. Passwords are
// taken verbatim and only an empty one is missing.
fn present_email(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn present_password(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn missing_fields() -> AppError {
    AppError::Validation("email and password required".into())
}

#[derive(Debug, Clone)]
pub struct Registered {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub token: String,
    pub user: PublicUser,
}

/// Registration and password login over a [`UserStore`].
pub struct AccountService {
    users: Arc<dyn UserStore>,
    keys: Arc<JwtKeys>,
    store_timeout: Duration,
}

impl AccountService {
    pub fn new(users: Arc<dyn UserStore>, keys: Arc<JwtKeys>, store_timeout: Duration) -> Self {
        Self {
            users,
            keys,
            store_timeout,
        }
    }

    #[instrument(skip_all)]
    pub async fn register(
        &self,
        email: Option<&str>,
        password: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<Registered, AppError> {
        let (Some(email), Some(password)) = (present_email(email), present_password(password)) else {
            warn!("register missing email or password");
            return Err(missing_fields());
        };

        let email = normalize_email(email);
        if !is_valid_email(&email) {
            warn!(email = %email, "invalid email");
            return Err(AppError::Validation("invalid email".into()));
        }

        let existing = with_deadline(self.store_timeout, self.users.find_by_email(&email)).await?;
        if existing.is_some() {
            warn!(email = %email, "email already registered");
            return Err(AppError::Conflict("email already in use".into()));
        }

        let hashed = hash_password(password)?;
        let display_name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from);
        let record = UserRecord::new(Uuid::new_v4(), email, hashed, display_name);

        // The conditional write still catches a registration that raced past the check.
        with_deadline(self.store_timeout, self.users.create(&record))
            .await
            .map_err(|e| {
                warn!(email = %record.email, error = %e, "create user rejected");
                AppError::from(e)
            })?;

        info!(user_id = %record.user_id, email = %record.email, "user registered");
        Ok(Registered {
            user_id: record.user_id,
            email: record.email,
        })
    }

    /// Unknown email and wrong password fail with the same error.
    #[instrument(skip_all)]
    pub async fn login(
        &self,
        email: Option<&str>,
        password: Option<&str>,
    ) -> Result<LoginOutcome, AppError> {
        let (Some(email), Some(password)) = (present_email(email), present_password(password)) else {
            warn!("login missing email or password");
            return Err(missing_fields());
        };
        let email = normalize_email(email);

        let user = match with_deadline(self.store_timeout, self.users.find_by_email(&email)).await? {
            Some(u) => u,
            None => {
                warn!(email = %email, "login unknown email");
                return Err(AppError::invalid_credentials());
            }
        };

        let ok = match verify_password(password, &user.hashed_password) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, user_id = %user.user_id, "stored password hash unreadable");
                false
            }
        };
        if !ok {
            warn!(email = %email, user_id = %user.user_id, "login invalid password");
            return Err(AppError::invalid_credentials());
        }

        let token = self.keys.sign(user.user_id, &user.email)?;
        info!(user_id = %user.user_id, email = %user.email, "user logged in");
        Ok(LoginOutcome {
            token,
            user: PublicUser::from(&user),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::JwtConfig,
        store::{EmailLookup, MemoryUserStore, StoreError},
    };
    use async_trait::async_trait;

    pub(crate) fn test_keys() -> Arc<JwtKeys> {
        Arc::new(JwtKeys::new(&JwtConfig {
            secret: "test".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            ttl_minutes: 5,
        }))
    }

    fn service_over(users: Arc<dyn UserStore>) -> AccountService {
        AccountService::new(users, test_keys(), Duration::from_millis(500))
    }

    fn service() -> AccountService {
        service_over(Arc::new(MemoryUserStore::new()))
    }

    /// Store whose email lookup never sees the record, as when two registrations
    /// race past the uniqueness check.
    struct BlindLookupStore(MemoryUserStore);

    #[async_trait]
    impl UserStore for BlindLookupStore {
        async fn find_by_email(&self, _email: &str) -> Result<Option<UserRecord>, StoreError> {
            Ok(None)
        }
        async fn find_by_pk(&self, pk: &str) -> Result<Option<UserRecord>, StoreError> {
            self.0.find_by_pk(pk).await
        }
        async fn create(&self, user: &UserRecord) -> Result<(), StoreError> {
            self.0.create(user).await
        }
        async fn add_s3_key(&self, pk: &str, key: &str) -> Result<(), StoreError> {
            self.0.add_s3_key(pk, key).await
        }
        fn lookup_strategy(&self) -> EmailLookup {
            EmailLookup::Index
        }
    }

    struct DownStore;

    #[async_trait]
    impl UserStore for DownStore {
        async fn find_by_email(&self, _email: &str) -> Result<Option<UserRecord>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn find_by_pk(&self, _pk: &str) -> Result<Option<UserRecord>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn create(&self, _user: &UserRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn add_s3_key(&self, _pk: &str, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn lookup_strategy(&self) -> EmailLookup {
            EmailLookup::Scan
        }
    }

    struct HangingStore;

    #[async_trait]
    impl UserStore for HangingStore {
        async fn find_by_email(&self, _email: &str) -> Result<Option<UserRecord>, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }
        async fn find_by_pk(&self, _pk: &str) -> Result<Option<UserRecord>, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }
        async fn create(&self, _user: &UserRecord) -> Result<(), StoreError> {
            Ok(())
        }
        async fn add_s3_key(&self, _pk: &str, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn lookup_strategy(&self) -> EmailLookup {
            EmailLookup::Index
        }
    }

    #[test]
    fn email_normalization_is_idempotent() {
        let once = normalize_email("  User@Example.COM ");
        assert_eq!(once, "user@example.com");
        assert_eq!(normalize_email(&once), once);
    }

    #[test]
    fn email_shape_check() {
        assert!(is_valid_email("a@b.com"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a b@c.com"));
        assert!(!is_valid_email("@c.com"));
    }

    #[tokio::test]
    async fn register_then_login_embeds_normalized_email() {
        let svc = service();
        let reg = svc
            .register(Some("  A@B.com "), Some("secret123"), None)
            .await
            .expect("register");
        assert_eq!(reg.email, "a@b.com");

        let out = svc
            .login(Some("a@b.com"), Some("secret123"))
            .await
            .expect("login");
        let claims = test_keys().verify(&out.token).expect("token verifies");
        assert_eq!(claims.email, "a@b.com");
        assert_eq!(claims.sub, reg.user_id);
        assert_eq!(out.user.user_id, reg.user_id);
        assert_eq!(out.user.display_name, "a");
    }

    #[tokio::test]
    async fn register_requires_both_fields() {
        let svc = service();
        for (email, password) in [
            (None, Some("secret123")),
            (Some("a@b.com"), None),
            (Some("   "), Some("secret123")),
            (Some("a@b.com"), Some("")),
        ] {
            let err = svc.register(email, password, None).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(ref m) if m == "email and password required"));
        }
    }

    #[tokio::test]
    async fn register_rejects_malformed_email() {
        let err = service()
            .register(Some("not-an-email"), Some("secret123"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let svc = service();
        svc.register(Some("a@b.com"), Some("secret123"), Some("Ann"))
            .await
            .unwrap();
        let err = svc
            .register(Some(" A@B.COM"), Some("other-pass"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "email already in use"));
    }

    #[tokio::test]
    async fn race_past_the_check_still_conflicts() {
        let svc = service_over(Arc::new(BlindLookupStore(MemoryUserStore::new())));
        svc.register(Some("a@b.com"), Some("secret123"), None)
            .await
            .unwrap();
        let err = svc
            .register(Some("a@b.com"), Some("secret123"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_email_and_wrong_password_are_indistinguishable() {
        let svc = service();
        svc.register(Some("a@b.com"), Some("secret123"), None)
            .await
            .unwrap();

        let wrong_password = svc.login(Some("a@b.com"), Some("wrong")).await.unwrap_err();
        let unknown = svc.login(Some("x@b.com"), Some("secret123")).await.unwrap_err();
        assert_eq!(wrong_password.status_code(), unknown.status_code());
        assert_eq!(wrong_password.public_message(), unknown.public_message());
        assert_eq!(unknown.public_message(), "invalid credentials");
    }

    #[tokio::test]
    async fn whitespace_password_is_a_real_password() {
        let svc = service();
        svc.register(Some("a@b.com"), Some("   "), None)
            .await
            .expect("blank-looking password accepted");
        assert!(svc.login(Some("a@b.com"), Some("   ")).await.is_ok());
        let err = svc.login(Some("a@b.com"), Some(" ")).await.unwrap_err();
        assert_eq!(err.public_message(), "invalid credentials");
    }

    #[tokio::test]
    async fn unsignable_token_is_an_internal_error() {
        let keys = Arc::new(JwtKeys::new(&JwtConfig {
            secret: "test".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            ttl_minutes: 200_000_000_000_000,
        }));
        let svc = AccountService::new(
            Arc::new(MemoryUserStore::new()),
            keys,
            Duration::from_millis(500),
        );
        svc.register(Some("a@b.com"), Some("secret123"), None)
            .await
            .unwrap();
        let err = svc.login(Some("a@b.com"), Some("secret123")).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn login_requires_both_fields() {
        let err = service().login(Some("a@b.com"), None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn login_works_through_scan_lookup() {
        let svc = service_over(Arc::new(MemoryUserStore::with_lookup(EmailLookup::Scan)));
        svc.register(Some("a@b.com"), Some("secret123"), None)
            .await
            .unwrap();
        assert!(svc.login(Some("A@b.com "), Some("secret123")).await.is_ok());
    }

    #[tokio::test]
    async fn display_name_is_kept() {
        let svc = service();
        svc.register(Some("a@b.com"), Some("secret123"), Some("  Ann  "))
            .await
            .unwrap();
        let out = svc.login(Some("a@b.com"), Some("secret123")).await.unwrap();
        assert_eq!(out.user.display_name, "Ann");
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_unavailable() {
        let svc = service_over(Arc::new(DownStore));
        let err = svc
            .register(Some("a@b.com"), Some("secret123"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(_)));
        let err = svc.login(Some("a@b.com"), Some("secret123")).await.unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn slow_store_hits_the_deadline() {
        let svc = AccountService::new(Arc::new(HangingStore), test_keys(), Duration::from_millis(20));
        let err = svc.login(Some("a@b.com"), Some("secret123")).await.unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(ref m) if m.contains("deadline")));
    }
}
