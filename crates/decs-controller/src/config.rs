//! Controller connection and credential configuration
//!
//! A [`CredentialConfig`] is validated once, in [`CredentialConfigBuilder::build`], and is
//! immutable afterwards. Every field can be set explicitly or picked up from the
//! environment through [`CredentialConfigBuilder::with_env_defaults`].

use crate::error::{DecsError, Result};
use decs_cloud::RetryConfig;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_CONTROLLER_URL: &str = "DECS_CONTROLLER_URL";
pub const ENV_AUTHENTICATOR: &str = "DECS_AUTHENTICATOR";
pub const ENV_USER: &str = "DECS_USER";
pub const ENV_PASSWORD: &str = "DECS_PASSWORD";
pub const ENV_APP_ID: &str = "DECS_APP_ID";
pub const ENV_APP_SECRET: &str = "DECS_APP_SECRET";
pub const ENV_OAUTH2_URL: &str = "DECS_OAUTH2_URL";
pub const ENV_JWT: &str = "DECS_JWT";
pub const ENV_ALLOW_UNVERIFIED_SSL: &str = "DECS_ALLOW_UNVERIFIED_SSL";

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// How the client authenticates against the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// User name and password, exchanged for an opaque session id
    Legacy,
    /// Application id and secret, exchanged for a JWT at the OAuth2 provider
    OAuth2,
    /// A JWT obtained elsewhere
    Jwt,
}

impl FromStr for AuthMode {
    type Err = DecsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "legacy" => Ok(AuthMode::Legacy),
            "oauth2" => Ok(AuthMode::OAuth2),
            "jwt" => Ok(AuthMode::Jwt),
            other => Err(DecsError::InvalidConfig(format!(
                "unknown authenticator mode '{}', expected one of 'legacy', 'oauth2', 'jwt'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Legacy => write!(f, "legacy"),
            AuthMode::OAuth2 => write!(f, "oauth2"),
            AuthMode::Jwt => write!(f, "jwt"),
        }
    }
}

/// Validated description of how to reach and authenticate against a DECS controller
#[derive(Clone)]
pub struct CredentialConfig {
    controller_url: String,
    mode: AuthMode,
    legacy_user: String,
    legacy_password: String,
    app_id: String,
    app_secret: String,
    oauth2_url: String,
    static_jwt: String,
    allow_unverified_ssl: bool,
    session_ttl: Duration,
    retry: RetryConfig,
}

impl CredentialConfig {
    pub fn builder() -> CredentialConfigBuilder {
        CredentialConfigBuilder::default()
    }

    /// Shorthand for `builder().with_env_defaults().build()`
    pub fn from_env() -> Result<Self> {
        Self::builder().with_env_defaults().build()
    }

    pub fn controller_url(&self) -> &str {
        &self.controller_url
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn legacy_user(&self) -> &str {
        &self.legacy_user
    }

    pub fn legacy_password(&self) -> &str {
        &self.legacy_password
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }

    pub fn oauth2_url(&self) -> &str {
        &self.oauth2_url
    }

    pub fn static_jwt(&self) -> &str {
        &self.static_jwt
    }

    pub fn allow_unverified_ssl(&self) -> bool {
        self.allow_unverified_ssl
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Names of the mode-specific fields that are empty.
    ///
    /// Always empty for a config that came out of `build()`.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let required: Vec<(&'static str, &str)> = match self.mode {
            AuthMode::Legacy => vec![
                ("user", self.legacy_user.as_str()),
                ("password", self.legacy_password.as_str()),
            ],
            AuthMode::OAuth2 => vec![
                ("oauth2_url", self.oauth2_url.as_str()),
                ("app_id", self.app_id.as_str()),
                ("app_secret", self.app_secret.as_str()),
            ],
            AuthMode::Jwt => vec![("jwt", self.static_jwt.as_str())],
        };

        required
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name)
            .collect()
    }

    /// Absolute URL of a controller API endpoint
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.controller_url, endpoint)
    }

    #[cfg(test)]
    pub(crate) fn with_cleared_secrets(mut self) -> Self {
        self.legacy_password.clear();
        self.app_secret.clear();
        self.static_jwt.clear();
        self
    }
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("controller_url", &self.controller_url)
            .field("mode", &self.mode)
            .field("legacy_user", &self.legacy_user)
            .field("legacy_password", &redact(&self.legacy_password))
            .field("app_id", &self.app_id)
            .field("app_secret", &redact(&self.app_secret))
            .field("oauth2_url", &self.oauth2_url)
            .field("static_jwt", &redact(&self.static_jwt))
            .field("allow_unverified_ssl", &self.allow_unverified_ssl)
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() { "" } else { "***" }
}

/// Builder for [`CredentialConfig`]
#[derive(Debug, Default, Clone)]
pub struct CredentialConfigBuilder {
    controller_url: Option<String>,
    authenticator: Option<String>,
    legacy_user: Option<String>,
    legacy_password: Option<String>,
    app_id: Option<String>,
    app_secret: Option<String>,
    oauth2_url: Option<String>,
    static_jwt: Option<String>,
    allow_unverified_ssl: Option<bool>,
    session_ttl: Option<Duration>,
    retry: Option<RetryConfig>,
}

impl CredentialConfigBuilder {
    pub fn controller_url(mut self, url: impl Into<String>) -> Self {
        self.controller_url = Some(url.into());
        self
    }

    pub fn mode(mut self, mode: AuthMode) -> Self {
        self.authenticator = Some(mode.to_string());
        self
    }

    /// Authentication mode as text (`legacy`, `oauth2` or `jwt`, any case)
    pub fn authenticator(mut self, authenticator: impl Into<String>) -> Self {
        self.authenticator = Some(authenticator.into());
        self
    }

    pub fn legacy_user(mut self, user: impl Into<String>) -> Self {
        self.legacy_user = Some(user.into());
        self
    }

    pub fn legacy_password(mut self, password: impl Into<String>) -> Self {
        self.legacy_password = Some(password.into());
        self
    }

    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn app_secret(mut self, app_secret: impl Into<String>) -> Self {
        self.app_secret = Some(app_secret.into());
        self
    }

    pub fn oauth2_url(mut self, url: impl Into<String>) -> Self {
        self.oauth2_url = Some(url.into());
        self
    }

    pub fn jwt(mut self, jwt: impl Into<String>) -> Self {
        self.static_jwt = Some(jwt.into());
        self
    }

    pub fn allow_unverified_ssl(mut self, allow: bool) -> Self {
        self.allow_unverified_ssl = Some(allow);
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Fill every field that is still unset from the `DECS_*` environment variables
    pub fn with_env_defaults(mut self) -> Self {
        fn env(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        self.controller_url = self.controller_url.or_else(|| env(ENV_CONTROLLER_URL));
        self.authenticator = self.authenticator.or_else(|| env(ENV_AUTHENTICATOR));
        self.legacy_user = self.legacy_user.or_else(|| env(ENV_USER));
        self.legacy_password = self.legacy_password.or_else(|| env(ENV_PASSWORD));
        self.app_id = self.app_id.or_else(|| env(ENV_APP_ID));
        self.app_secret = self.app_secret.or_else(|| env(ENV_APP_SECRET));
        self.oauth2_url = self.oauth2_url.or_else(|| env(ENV_OAUTH2_URL));
        self.static_jwt = self.static_jwt.or_else(|| env(ENV_JWT));
        if self.allow_unverified_ssl.is_none() {
            self.allow_unverified_ssl = env(ENV_ALLOW_UNVERIFIED_SSL)
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"));
        }
        self
    }

    /// Validate the collected fields for the selected mode
    pub fn build(self) -> Result<CredentialConfig> {
        let controller_url = normalize_url(self.controller_url.as_deref().unwrap_or_default());
        if controller_url.is_empty() {
            return Err(DecsError::InvalidConfig(
                "empty DECS cloud controller URL provided".to_string(),
            ));
        }

        let authenticator = self.authenticator.ok_or_else(|| {
            DecsError::InvalidConfig("no authenticator mode provided".to_string())
        })?;
        let mode = AuthMode::from_str(&authenticator)?;

        let config = CredentialConfig {
            controller_url,
            mode,
            legacy_user: self.legacy_user.unwrap_or_default(),
            legacy_password: self.legacy_password.unwrap_or_default(),
            app_id: self.app_id.unwrap_or_default(),
            app_secret: self.app_secret.unwrap_or_default(),
            oauth2_url: normalize_url(self.oauth2_url.as_deref().unwrap_or_default()),
            static_jwt: self.static_jwt.unwrap_or_default().trim().to_string(),
            allow_unverified_ssl: self.allow_unverified_ssl.unwrap_or(false),
            session_ttl: self.session_ttl.unwrap_or(DEFAULT_SESSION_TTL),
            retry: self.retry.unwrap_or_default(),
        };

        if let Some(field) = config.missing_fields().first() {
            return Err(DecsError::InvalidConfig(format!(
                "authenticator mode '{}' specified but no {} provided",
                mode, field
            )));
        }

        Ok(config)
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}
