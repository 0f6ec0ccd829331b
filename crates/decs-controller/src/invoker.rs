//! Single logical API call against the controller
//!
//! [`ApiInvoker::call`] attaches the current session, retries transport failures with backoff
//! and, when the controller answers 401, renews the session and retries exactly once.

use crate::auth::{AuthManager, Session};
use crate::config::CredentialConfig;
use crate::error::{DecsError, Result};
use crate::transport::{HttpReply, HttpRequest, Method, Transport};
use std::sync::Arc;
use std::time::Duration;

/// Per-call timeout class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTimeout {
    /// Lookups and listings
    Read,
    Default,
    /// Machine and disk creation, which the controller answers only once the object exists
    Create,
}

impl CallTimeout {
    pub fn duration(self) -> Duration {
        match self {
            CallTimeout::Read => Duration::from_secs(30),
            CallTimeout::Default => Duration::from_secs(60),
            CallTimeout::Create => Duration::from_secs(180),
        }
    }
}

/// Ordered form parameters of a call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormParams(Vec<(String, String)>);

impl FormParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: &str, value: impl ToString) {
        self.0.push((key.to_string(), value.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn to_vec(&self) -> Vec<(String, String)> {
        self.0.clone()
    }
}

/// Issues authenticated calls on behalf of one [`CredentialConfig`]
pub struct ApiInvoker {
    config: Arc<CredentialConfig>,
    transport: Arc<dyn Transport>,
    auth: Arc<AuthManager>,
}

impl ApiInvoker {
    pub fn new(
        config: Arc<CredentialConfig>,
        transport: Arc<dyn Transport>,
        auth: Arc<AuthManager>,
    ) -> Self {
        Self {
            config,
            transport,
            auth,
        }
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    /// POST shorthand for [`ApiInvoker::call`]
    pub async fn post(
        &self,
        endpoint: &str,
        params: &FormParams,
        timeout: CallTimeout,
    ) -> Result<String> {
        self.call(Method::POST, endpoint, params, timeout).await
    }

    /// Call `endpoint` and return the raw response body of a 2xx answer
    pub async fn call(
        &self,
        method: Method,
        endpoint: &str,
        params: &FormParams,
        timeout: CallTimeout,
    ) -> Result<String> {
        let session = self.auth.ensure_valid().await?;
        let reply = self
            .send_with_retry(&method, endpoint, params, timeout, &session)
            .await?;

        if reply.status == 401 {
            tracing::warn!(
                "DECS controller rejected the session on {}, re-authenticating once",
                endpoint
            );
            let fresh = self.auth.renew(&session).await?;
            let retried = self
                .send_with_retry(&method, endpoint, params, timeout, &fresh)
                .await?;
            return into_body(endpoint, retried);
        }

        into_body(endpoint, reply)
    }

    async fn send_with_retry(
        &self,
        method: &Method,
        endpoint: &str,
        params: &FormParams,
        timeout: CallTimeout,
        session: &Session,
    ) -> Result<HttpReply> {
        let retry = self.config.retry();
        let max_attempts = retry.max_attempts.max(1);
        let url = self.config.endpoint_url(endpoint);

        let mut attempt = 0;
        loop {
            let mut request =
                HttpRequest::post(url.as_str(), timeout.duration()).form(params.to_vec());
            request.method = method.clone();
            let request = session.apply(request);

            tracing::debug!("{} {} (attempt {}/{})", method, endpoint, attempt + 1, max_attempts);

            match self.transport.send(request).await {
                Ok(reply) => {
                    tracing::debug!("{} answered HTTP {}", endpoint, reply.status);
                    return Ok(reply);
                }
                Err(e) if attempt + 1 < max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    tracing::warn!("{} failed: {}, retrying in {:?}", endpoint, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(DecsError::Transient {
                        endpoint: endpoint.to_string(),
                        attempts: max_attempts,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

fn into_body(endpoint: &str, reply: HttpReply) -> Result<String> {
    if reply.is_success() {
        Ok(reply.body)
    } else {
        Err(DecsError::Api {
            endpoint: endpoint.to_string(),
            status: reply.status,
            body: reply.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api;
    use crate::config::AuthMode;
    use crate::mock::{MockReply, MockTransport};
    use decs_cloud::RetryConfig;

    fn invoker(mock: &MockTransport, retry: RetryConfig) -> ApiInvoker {
        let config = Arc::new(
            CredentialConfig::builder()
                .controller_url("https://ctl.example.com")
                .mode(AuthMode::Legacy)
                .legacy_user("admin")
                .legacy_password("secret")
                .retry(retry)
                .build()
                .unwrap(),
        );
        let transport: Arc<dyn Transport> = Arc::new(mock.clone());
        let auth = Arc::new(AuthManager::new(Arc::clone(&config), Arc::clone(&transport)));
        ApiInvoker::new(config, transport, auth)
    }

    #[tokio::test]
    async fn test_form_params_and_session_attached() {
        let mock = MockTransport::new();
        mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid-1"))
            .on(api::MACHINE_GET_API, MockReply::ok("{}"));
        let invoker = invoker(&mock, RetryConfig::immediate(3));

        let params = FormParams::new().with("machineId", 42);
        let body = invoker
            .post(api::MACHINE_GET_API, &params, CallTimeout::Read)
            .await
            .unwrap();
        assert_eq!(body, "{}");

        let call = &mock.calls_to(api::MACHINE_GET_API)[0];
        assert_eq!(call.url, "https://ctl.example.com/restmachine/cloudapi/machines/get");
        assert_eq!(call.param("machineId"), Some("42"));
        assert_eq!(call.param("authkey"), Some("sid-1"));
        assert_eq!(call.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_transport_failures_are_retried_then_surface_transient() {
        let mock = MockTransport::new();
        mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"))
            .on(api::MACHINE_LIST_API, MockReply::Timeout)
            .on(api::MACHINE_LIST_API, MockReply::ok("[]"));
        let invoker = invoker(&mock, RetryConfig::immediate(3));

        let body = invoker
            .post(api::MACHINE_LIST_API, &FormParams::new(), CallTimeout::Read)
            .await
            .unwrap();
        assert_eq!(body, "[]");
        assert_eq!(mock.call_count(api::MACHINE_LIST_API), 2);

        let failing = MockTransport::new();
        failing
            .on(api::LEGACY_LOGIN_API, MockReply::ok("sid"))
            .on(api::MACHINE_LIST_API, MockReply::ConnectionReset);
        let invoker = self::invoker(&failing, RetryConfig::immediate(3));

        let err = invoker
            .post(api::MACHINE_LIST_API, &FormParams::new(), CallTimeout::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, DecsError::Transient { attempts: 3, .. }));
        assert_eq!(failing.call_count(api::MACHINE_LIST_API), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let mock = MockTransport::new();
        mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"))
            .on(api::MACHINE_LIST_API, MockReply::Timeout);
        let invoker = invoker(&mock, RetryConfig::default());

        let started = tokio::time::Instant::now();
        let err = invoker
            .post(api::MACHINE_LIST_API, &FormParams::new(), CallTimeout::Read)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_api_errors_are_not_retried() {
        let mock = MockTransport::new();
        mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"))
            .on(api::MACHINE_CREATE_API, MockReply::status(400, "bad image"));
        let invoker = invoker(&mock, RetryConfig::immediate(3));

        let err = invoker
            .post(api::MACHINE_CREATE_API, &FormParams::new(), CallTimeout::Create)
            .await
            .unwrap_err();
        match err {
            DecsError::Api { status, body, .. } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad image");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
        assert_eq!(mock.call_count(api::MACHINE_CREATE_API), 1);
    }
}
