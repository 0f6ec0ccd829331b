//! Session acquisition and caching
//!
//! [`AuthManager`] turns a [`CredentialConfig`] into a [`Session`] and keeps exactly one of them
//! cached. The cache lock is held while a session is being (re)acquired, so callers that find the
//! session expired at the same time wait for one refresh and then share its result.

use crate::api::{self, JwtExchangeRecord};
use crate::config::{AuthMode, CredentialConfig};
use crate::error::{AuthFailure, DecsError, Result};
use crate::invoker::CallTimeout;
use crate::transport::{HttpReply, HttpRequest, Transport};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sessions this close to expiry are refreshed before use
const EXPIRY_SKEW_SECS: i64 = 30;

/// How the session token is attached to requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Opaque session id, sent as the `authkey` form parameter
    SessionId,
    /// JWT, sent in the `Authorization` header
    Bearer,
}

/// An authenticated session. Replaced wholesale on refresh, never mutated.
#[derive(Clone)]
pub struct Session {
    token: String,
    kind: TokenKind,
    obtained_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    username: String,
}

impl Session {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn obtained_at(&self) -> DateTime<Utc> {
        self.obtained_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + ChronoDuration::seconds(EXPIRY_SKEW_SECS) >= self.expires_at
    }

    /// Attach this session's credential to a request
    pub fn apply(&self, request: HttpRequest) -> HttpRequest {
        match self.kind {
            TokenKind::SessionId => {
                let mut request = request;
                request.form.push(("authkey".to_string(), self.token.clone()));
                request
            }
            TokenKind::Bearer => request.bearer(self.token.clone()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"***")
            .field("kind", &self.kind)
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .field("username", &self.username)
            .finish()
    }
}

/// Claims read from an unverified JWT payload
#[derive(Debug, Default, Deserialize)]
struct JwtClaims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

impl JwtClaims {
    /// Decode the payload segment of a JWT. Opaque or malformed tokens yield no claims.
    fn parse(token: &str) -> Option<Self> {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn username(&self) -> Option<&str> {
        self.username
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|name| !name.is_empty())
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }
}

/// Produces, caches and refreshes the session for one [`CredentialConfig`]
pub struct AuthManager {
    config: Arc<CredentialConfig>,
    transport: Arc<dyn Transport>,
    cache: Mutex<Option<Arc<Session>>>,
}

impl AuthManager {
    pub fn new(config: Arc<CredentialConfig>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            cache: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Authenticate unconditionally and cache the new session
    pub async fn obtain_session(&self) -> Result<Arc<Session>> {
        let mut cache = self.cache.lock().await;
        let session = Arc::new(self.authenticate().await?);
        *cache = Some(Arc::clone(&session));
        Ok(session)
    }

    /// The cached session, re-authenticating if there is none or it has expired
    pub async fn ensure_valid(&self) -> Result<Arc<Session>> {
        let mut cache = self.cache.lock().await;
        if let Some(session) = cache.as_ref().filter(|s| !s.is_expired()) {
            return Ok(Arc::clone(session));
        }

        if cache.is_some() {
            tracing::debug!("DECS session expired, re-authenticating");
        }
        let session = Arc::new(self.authenticate().await?);
        *cache = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Replace a session the controller rejected.
    ///
    /// When another caller already replaced `stale`, its replacement is returned as is.
    pub async fn renew(&self, stale: &Session) -> Result<Arc<Session>> {
        let mut cache = self.cache.lock().await;
        let replaced = cache
            .as_ref()
            .filter(|current| current.token != stale.token && !current.is_expired());
        if let Some(current) = replaced {
            return Ok(Arc::clone(current));
        }

        let session = Arc::new(self.authenticate().await?);
        *cache = Some(Arc::clone(&session));
        Ok(session)
    }

    /// The cached session, if any, without validating it
    pub async fn current(&self) -> Option<Arc<Session>> {
        self.cache.lock().await.clone()
    }

    async fn authenticate(&self) -> Result<Session> {
        let missing = self.config.missing_fields();
        if !missing.is_empty() {
            return Err(DecsError::auth(
                AuthFailure::MissingCredential,
                format!(
                    "authenticator mode '{}' requires: {}",
                    self.config.mode(),
                    missing.join(", ")
                ),
            ));
        }

        tracing::debug!(
            "Authenticating against {} using {} mode",
            self.config.controller_url(),
            self.config.mode()
        );

        let session = match self.config.mode() {
            AuthMode::Legacy => self.legacy_login().await?,
            AuthMode::OAuth2 => {
                let jwt = self.oauth2_token().await?;
                self.exchange_jwt(&jwt).await?
            }
            AuthMode::Jwt => {
                let jwt = self.config.static_jwt().to_string();
                self.exchange_jwt(&jwt).await?
            }
        };

        tracing::info!(
            "Authenticated to DECS controller as '{}' (session valid until {})",
            session.username,
            session.expires_at
        );
        Ok(session)
    }

    /// Fail unless the configured mode is one of `allowed`
    fn require_mode(&self, allowed: &[AuthMode], what: &str) -> Result<()> {
        let mode = self.config.mode();
        if allowed.contains(&mode) {
            return Ok(());
        }
        Err(DecsError::auth(
            AuthFailure::ModeMismatch,
            format!("{} is not available in '{}' mode", what, mode),
        ))
    }

    async fn legacy_login(&self) -> Result<Session> {
        self.require_mode(&[AuthMode::Legacy], "legacy login")?;
        let request = HttpRequest::post(
            self.config.endpoint_url(api::LEGACY_LOGIN_API),
            CallTimeout::Read.duration(),
        )
        .form(vec![
            ("username".to_string(), self.config.legacy_user().to_string()),
            ("password".to_string(), self.config.legacy_password().to_string()),
        ]);

        let reply = self.send_auth(request, "legacy login").await?;
        let sid = api::decode_token(&reply.body);
        if sid.is_empty() {
            return Err(DecsError::auth(
                AuthFailure::Rejected,
                "legacy login returned an empty session id",
            ));
        }

        let now = Utc::now();
        Ok(Session {
            token: sid,
            kind: TokenKind::SessionId,
            obtained_at: now,
            expires_at: now + self.ttl(),
            username: self.config.legacy_user().to_string(),
        })
    }

    async fn oauth2_token(&self) -> Result<String> {
        self.require_mode(&[AuthMode::OAuth2], "OAuth2 token request")?;
        let url = format!("{}{}", self.config.oauth2_url(), api::OAUTH2_TOKEN_API);
        let request = HttpRequest::post(url, CallTimeout::Read.duration()).form(vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), self.config.app_id().to_string()),
            ("client_secret".to_string(), self.config.app_secret().to_string()),
            ("response_type".to_string(), "id_token".to_string()),
            ("validity".to_string(), self.config.session_ttl().as_secs().to_string()),
        ]);

        let reply = self.send_auth(request, "OAuth2 token request").await?;
        let jwt = api::decode_token(&reply.body);
        if jwt.is_empty() {
            return Err(DecsError::auth(
                AuthFailure::Rejected,
                "OAuth2 provider returned an empty token",
            ));
        }
        Ok(jwt)
    }

    /// Resolve the user behind a JWT at the controller
    async fn exchange_jwt(&self, jwt: &str) -> Result<Session> {
        self.require_mode(&[AuthMode::OAuth2, AuthMode::Jwt], "JWT exchange")?;
        let request = HttpRequest::post(
            self.config.endpoint_url(api::JWT_EXCHANGE_API),
            CallTimeout::Read.duration(),
        )
        .bearer(jwt);

        let reply = self.send_auth(request, "JWT exchange").await?;
        let claims = JwtClaims::parse(jwt).unwrap_or_default();
        let exchanged = parse_exchange_reply(&reply.body);

        let username = Some(exchanged.username.as_str())
            .filter(|name| !name.is_empty())
            .or_else(|| claims.username())
            .map(str::to_string)
            .ok_or_else(|| {
                DecsError::auth(
                    AuthFailure::Rejected,
                    "controller did not resolve a user name for the supplied JWT",
                )
            })?;

        let now = Utc::now();
        let ttl_limit = now + self.ttl();
        let expires_at = claims
            .expires_at()
            .map_or(ttl_limit, |exp| exp.min(ttl_limit));

        let (token, kind) = match exchanged.session_id.filter(|sid| !sid.is_empty()) {
            Some(sid) => (sid, TokenKind::SessionId),
            None => (jwt.to_string(), TokenKind::Bearer),
        };

        Ok(Session {
            token,
            kind,
            obtained_at: now,
            expires_at,
            username,
        })
    }

    async fn send_auth(&self, request: HttpRequest, what: &str) -> Result<HttpReply> {
        let reply = self.transport.send(request).await.map_err(|e| {
            DecsError::auth(AuthFailure::NetworkFailure, format!("{} failed: {}", what, e))
        })?;

        if !reply.is_success() {
            return Err(DecsError::auth(
                AuthFailure::Rejected,
                format!(
                    "{} answered HTTP {}: {}",
                    what,
                    reply.status,
                    api::truncate(reply.body.trim(), 200)
                ),
            ));
        }
        Ok(reply)
    }

    fn ttl(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.session_ttl())
            .unwrap_or_else(|_| ChronoDuration::seconds(3600))
    }
}

/// The exchange endpoint answers with an object, a bare user name, or nothing at all
fn parse_exchange_reply(body: &str) -> JwtExchangeRecord {
    let body = body.trim();
    if body.is_empty() {
        return JwtExchangeRecord::default();
    }
    if body.starts_with('{') {
        return api::decode(api::JWT_EXCHANGE_API, body).unwrap_or_default();
    }
    JwtExchangeRecord {
        username: api::decode_token(body),
        session_id: None,
    }
}
