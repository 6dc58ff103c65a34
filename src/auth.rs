//! Credential resolution and session caching.
//!
//! An inbound `Authorization` header is parsed into a [`Credential`],
//! classified into an [`AuthMethod`] and verified either locally (static
//! user map) or against Audiobookshelf. Verified sessions are cached in the
//! auth namespace under the credential fingerprint, and concurrent
//! resolutions of the same credential share one verification.

use crate::cache::{Cache, Namespace};
use crate::config::{AuthConfig, Config};
use crate::error::{AppError, Result};
use crate::upstream::UpstreamClient;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Subject of sessions created when authentication is disabled.
pub const ANONYMOUS: &str = "anonymous";

const MAX_SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Authorization scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `Basic base64(user:secret)`.
    Basic,
    /// `Bearer token`.
    Bearer,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Basic => "basic",
            Scheme::Bearer => "bearer",
        }
    }
}

/// Credential presented by a client.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Scheme of the header.
    pub scheme: Scheme,
    /// Username for Basic, empty for Bearer.
    pub identifier: String,
    /// Password, API key or token.
    pub secret: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// Parse an `Authorization` header value. Scheme names are case-insensitive.
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, rest) = header
            .split_once(char::is_whitespace)
            .ok_or_else(|| AppError::Unauthorized("malformed authorization header".to_string()))?;
        let rest = rest.trim();

        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = STANDARD
                .decode(rest)
                .map_err(|_| AppError::Unauthorized("malformed basic credentials".to_string()))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| AppError::Unauthorized("malformed basic credentials".to_string()))?;
            let (user, secret) = decoded
                .split_once(':')
                .ok_or_else(|| AppError::Unauthorized("malformed basic credentials".to_string()))?;

            if user.is_empty() || secret.is_empty() {
                return Err(AppError::Unauthorized("empty username or password".to_string()));
            }

            Ok(Self {
                scheme: Scheme::Basic,
                identifier: user.to_string(),
                secret: secret.to_string(),
            })
        } else if scheme.eq_ignore_ascii_case("bearer") {
            if rest.is_empty() {
                return Err(AppError::Unauthorized("empty bearer token".to_string()));
            }

            Ok(Self {
                scheme: Scheme::Bearer,
                identifier: String::new(),
                secret: rest.to_string(),
            })
        } else {
            Err(AppError::Unauthorized(format!(
                "unsupported authorization scheme '{}'",
                scheme
            )))
        }
    }

    /// Stable SHA-256 hex digest of scheme, identifier and secret.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.scheme.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.identifier.as_bytes());
        hasher.update([0]);
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// How a credential is verified.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Basic credential checked against the static user map or `POST /login`.
    UsernamePassword {
        /// Username.
        username: String,
        /// Password or configured key.
        password: String,
    },
    /// Basic credential whose password is an Audiobookshelf API key.
    ApiKeyAsBasic {
        /// Username sent by the client.
        username: String,
        /// API key.
        key: String,
    },
    /// Bearer token passed through to Audiobookshelf.
    BearerToken {
        /// Token.
        token: String,
    },
}

impl AuthMethod {
    /// Classify a credential for the configured mode.
    pub fn classify(credential: &Credential, api_key_auth: bool) -> Self {
        match credential.scheme {
            Scheme::Bearer => AuthMethod::BearerToken {
                token: credential.secret.clone(),
            },
            Scheme::Basic if api_key_auth => AuthMethod::ApiKeyAsBasic {
                username: credential.identifier.clone(),
                key: credential.secret.clone(),
            },
            Scheme::Basic => AuthMethod::UsernamePassword {
                username: credential.identifier.clone(),
                password: credential.secret.clone(),
            },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            AuthMethod::UsernamePassword { .. } => "username_password",
            AuthMethod::ApiKeyAsBasic { .. } => "api_key_as_basic",
            AuthMethod::BearerToken { .. } => "bearer_token",
        }
    }
}

/// Verified identity with the token used against Audiobookshelf.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Identity the catalog is built for.
    pub subject: String,
    /// Audiobookshelf user id, when known.
    pub user_id: Option<String>,
    /// Bearer token for upstream calls.
    pub upstream_token: String,
    /// When the session was verified.
    pub issued_at: DateTime<Utc>,
    /// When the session must be verified again.
    pub expires_at: DateTime<Utc>,
    /// Fingerprint of the credential that produced it.
    pub fingerprint: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("subject", &self.subject)
            .field("user_id", &self.user_id)
            .field("upstream_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Session {
    /// Create a session valid for `ttl` from now.
    pub fn new(
        subject: impl Into<String>,
        user_id: Option<String>,
        upstream_token: impl Into<String>,
        ttl: std::time::Duration,
        fingerprint: impl Into<String>,
    ) -> Self {
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl.min(MAX_SESSION_TTL)).unwrap_or(chrono::Duration::zero());

        Self {
            subject: subject.into(),
            user_id,
            upstream_token: upstream_token.into(),
            issued_at,
            expires_at: issued_at + ttl,
            fingerprint: fingerprint.into(),
        }
    }

    /// Whether the session has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Outcome of a failed resolution, shared by every waiter of a flight.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Credential rejected.
    #[error("{0}")]
    Unauthorized(String),
    /// Audiobookshelf could not be reached.
    #[error("{0}")]
    UpstreamUnavailable(String),
}

impl From<AppError> for AuthError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Unauthorized(msg) => AuthError::Unauthorized(msg),
            AppError::NotFound(path) => {
                AuthError::Unauthorized(format!("identity endpoint {} not found", path))
            }
            other => AuthError::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized(msg) => AppError::Unauthorized(msg),
            AuthError::UpstreamUnavailable(msg) => AppError::UpstreamUnavailable(msg),
        }
    }
}

type Flight = Arc<OnceCell<std::result::Result<Session, AuthError>>>;

/// Removes a flight from the registry once it is settled or its last waiter leaves.
///
/// The registry holds one reference and every waiter's guard holds one, so a
/// count of two means this guard is the only waiter left.
struct FlightGuard<'a> {
    registry: &'a Mutex<HashMap<String, Flight>>,
    key: &'a str,
    flight: Flight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        if registry
            .get(self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.flight))
            && (self.flight.initialized() || Arc::strong_count(&self.flight) == 2)
        {
            registry.remove(self.key);
        }
    }
}

/// Resolves credentials into sessions.
pub struct AuthResolver {
    settings: AuthConfig,
    default_api_key: Option<String>,
    cache: Arc<Cache>,
    upstream: Arc<UpstreamClient>,
    inflight: Mutex<HashMap<String, Flight>>,
}

impl AuthResolver {
    /// Create a resolver.
    pub fn new(config: &Config, cache: Arc<Cache>, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            settings: config.auth.clone(),
            default_api_key: config.upstream.api_key.clone().filter(|k| !k.is_empty()),
            cache,
            upstream,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the `Authorization` header of a request.
    pub async fn authenticate(&self, header: Option<&str>) -> Result<Session> {
        match header.map(str::trim).filter(|h| !h.is_empty()) {
            None if !self.settings.enabled => self.anonymous(),
            None => Err(AppError::Unauthorized("authentication required".to_string())),
            Some(raw) => {
                let credential = Credential::parse(raw)?;
                Ok(self.resolve(&credential).await?)
            }
        }
    }

    fn anonymous(&self) -> Result<Session> {
        let key = self.default_api_key.clone().ok_or_else(|| {
            AppError::Config("authentication is disabled but no upstream API key is set".to_string())
        })?;

        Ok(Session::new(
            ANONYMOUS,
            None,
            key,
            self.settings.session_ttl(),
            String::new(),
        ))
    }

    /// Resolve a credential, sharing in-flight verifications per fingerprint.
    pub async fn resolve(&self, credential: &Credential) -> std::result::Result<Session, AuthError> {
        let fingerprint = credential.fingerprint();

        if let Some(session) = self.cached(&fingerprint) {
            tracing::debug!(subject = %session.subject, "Session cache hit");
            return Ok(session);
        }

        let guard = FlightGuard {
            registry: &self.inflight,
            key: &fingerprint,
            flight: self
                .inflight
                .lock()
                .entry(fingerprint.clone())
                .or_default()
                .clone(),
        };

        let result = guard
            .flight
            .get_or_init(|| async {
                if let Some(session) = self.cached(&fingerprint) {
                    return Ok(session);
                }

                let method = AuthMethod::classify(credential, self.settings.api_key_auth);
                let outcome = self.verify(&method, &fingerprint).await;
                match &outcome {
                    Ok(session) => {
                        tracing::info!(subject = %session.subject, method = method.name(), "Credential verified");
                        self.store(session);
                    }
                    Err(e) => {
                        tracing::warn!(method = method.name(), error = %e, "Credential verification failed");
                    }
                }
                outcome
            })
            .await
            .clone();

        drop(guard);
        result
    }

    async fn verify(&self, method: &AuthMethod, fingerprint: &str) -> std::result::Result<Session, AuthError> {
        let ttl = self.settings.session_ttl();

        match method {
            AuthMethod::UsernamePassword { username, password } if !self.settings.users.is_empty() => {
                match self.settings.users.get(username) {
                    Some(key) if digest(key) == digest(password) => {
                        Ok(Session::new(username.clone(), None, key.clone(), ttl, fingerprint))
                    }
                    _ => Err(AuthError::Unauthorized("invalid username or password".to_string())),
                }
            }
            AuthMethod::UsernamePassword { username, password } => {
                let user = self.upstream.login(username, password).await?;
                let token = user
                    .token
                    .clone()
                    .or_else(|| user.access_token.clone())
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| AuthError::Unauthorized("login returned no token".to_string()))?;
                Ok(Session::new(user.username, Some(user.id), token, ttl, fingerprint))
            }
            AuthMethod::ApiKeyAsBasic { username, key } => {
                let user = self.upstream.me(key).await?;
                if !user.username.eq_ignore_ascii_case(username) {
                    tracing::debug!(
                        presented = %username,
                        owner = %user.username,
                        "API key owner differs from presented username"
                    );
                }
                Ok(Session::new(user.username, Some(user.id), key.clone(), ttl, fingerprint))
            }
            AuthMethod::BearerToken { token } => {
                let user = self.upstream.me(token).await?;
                Ok(Session::new(user.username, Some(user.id), token.clone(), ttl, fingerprint))
            }
        }
    }

    fn cached(&self, fingerprint: &str) -> Option<Session> {
        let session: Session = self.cache.get_as(Namespace::Auth, fingerprint)?;
        if session.is_expired() {
            self.cache.invalidate(Namespace::Auth, fingerprint);
            return None;
        }
        Some(session)
    }

    fn store(&self, session: &Session) {
        let remaining = (session.expires_at - Utc::now()).to_std().unwrap_or_default();
        self.cache
            .set_as(Namespace::Auth, &session.fingerprint, session, remaining);
    }

    /// Drop the cached session of a credential fingerprint.
    pub fn invalidate(&self, fingerprint: &str) -> bool {
        self.cache.invalidate(Namespace::Auth, fingerprint)
    }

    /// Number of verifications currently in flight.
    pub fn pending(&self) -> usize {
        self.inflight.lock().len()
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn basic(user: &str, secret: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, secret)))
    }

    fn resolver(mutate: impl FnOnce(&mut Config)) -> AuthResolver {
        let mut config = Config::default();
        config.upstream.url = "http://127.0.0.1:9".to_string();
        config.upstream.retries = 0;
        mutate(&mut config);

        let cache = Arc::new(Cache::in_memory());
        let upstream = Arc::new(UpstreamClient::new(&config, cache.clone()).unwrap());
        AuthResolver::new(&config, cache, upstream)
    }

    #[test]
    fn parses_basic_case_insensitively() {
        let credential = Credential::parse(&basic("alice", "pa:ss").replace("Basic", "bAsIc")).unwrap();
        assert_eq!(credential.scheme, Scheme::Basic);
        assert_eq!(credential.identifier, "alice");
        assert_eq!(credential.secret, "pa:ss");
    }

    #[test]
    fn parses_bearer() {
        let credential = Credential::parse("BEARER  tok123 ").unwrap();
        assert_eq!(credential.scheme, Scheme::Bearer);
        assert_eq!(credential.secret, "tok123");
    }

    #[test]
    fn rejects_malformed_headers() {
        let empty_user = basic("", "x");
        for header in ["Basic", "Basic !!!", "Digest abc", "Bearer ", empty_user.as_str()] {
            assert!(
                matches!(Credential::parse(header), Err(AppError::Unauthorized(_))),
                "{header}"
            );
        }
    }

    #[test]
    fn fingerprint_is_stable_and_scheme_bound() {
        let a = Credential::parse(&basic("alice", "k1")).unwrap();
        let b = Credential::parse(&basic("alice", "k1")).unwrap();
        let c = Credential::parse("Bearer k1").unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn classification_follows_mode() {
        let credential = Credential::parse(&basic("alice", "k1")).unwrap();
        assert!(matches!(
            AuthMethod::classify(&credential, false),
            AuthMethod::UsernamePassword { .. }
        ));
        assert!(matches!(
            AuthMethod::classify(&credential, true),
            AuthMethod::ApiKeyAsBasic { .. }
        ));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let credential = Credential::parse(&basic("alice", "hunter2")).unwrap();
        assert!(!format!("{:?}", credential).contains("hunter2"));

        let session = Session::new("alice", None, "tok-secret", Duration::from_secs(5), "fp");
        assert!(!format!("{:?}", session).contains("tok-secret"));
    }

    #[tokio::test]
    async fn static_users_verify_locally() {
        let auth = resolver(|c| {
            c.auth.users.insert("alice".to_string(), "key-a".to_string());
        });

        let session = auth.authenticate(Some(&basic("alice", "key-a"))).await.unwrap();
        assert_eq!(session.subject, "alice");
        assert_eq!(session.upstream_token, "key-a");

        let err = auth.authenticate(Some(&basic("alice", "wrong"))).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert_eq!(auth.pending(), 0);
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized_when_enabled() {
        let auth = resolver(|_| {});
        assert!(matches!(
            auth.authenticate(None).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn disabled_auth_uses_default_key() {
        let auth = resolver(|c| {
            c.auth.enabled = false;
            c.upstream.api_key = Some("service-key".to_string());
        });

        let session = auth.authenticate(None).await.unwrap();
        assert_eq!(session.subject, ANONYMOUS);
        assert_eq!(session.upstream_token, "service-key");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_not_unauthorized() {
        let auth = resolver(|_| {});
        let err = auth.authenticate(Some("Bearer abc")).await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn expired_sessions_are_not_reused() {
        let auth = resolver(|c| {
            c.auth.users.insert("alice".to_string(), "key-a".to_string());
        });
        let credential = Credential::parse(&basic("alice", "key-a")).unwrap();
        let fingerprint = credential.fingerprint();

        let mut stale = Session::new("alice", None, "key-a", Duration::from_secs(60), fingerprint.clone());
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        auth.cache
            .set_as(Namespace::Auth, &fingerprint, &stale, Duration::from_secs(60));

        let session = auth.resolve(&credential).await.unwrap();
        assert!(!session.is_expired());
        assert!(auth.invalidate(&fingerprint));
    }
}
