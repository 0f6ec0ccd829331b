//! Entry point tying configuration, session and services together

use crate::auth::{AuthManager, Session};
use crate::catalog::Catalog;
use crate::config::CredentialConfig;
use crate::error::Result;
use crate::invoker::ApiInvoker;
use crate::orchestrator::ProvisioningOrchestrator;
use crate::resgroup::ResourceGroups;
use crate::transport::{ReqwestTransport, Transport};
use decs_cloud::AuthStatus;
use std::sync::Arc;

/// Client for one DECS controller and one set of credentials.
///
/// Cheap to clone; clones share the cached session.
#[derive(Clone)]
pub struct DecsClient {
    config: Arc<CredentialConfig>,
    auth: Arc<AuthManager>,
    invoker: Arc<ApiInvoker>,
}

impl DecsClient {
    /// Client talking HTTPS through reqwest
    pub fn new(config: CredentialConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.allow_unverified_ssl())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Client on top of any [`Transport`]
    pub fn with_transport(config: CredentialConfig, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        let auth = Arc::new(AuthManager::new(Arc::clone(&config), Arc::clone(&transport)));
        let invoker = Arc::new(ApiInvoker::new(
            Arc::clone(&config),
            transport,
            Arc::clone(&auth),
        ));

        Self {
            config,
            auth,
            invoker,
        }
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn invoker(&self) -> &ApiInvoker {
        &self.invoker
    }

    pub fn orchestrator(&self) -> ProvisioningOrchestrator {
        ProvisioningOrchestrator::new(Arc::clone(&self.invoker))
    }

    pub fn resource_groups(&self) -> ResourceGroups {
        ResourceGroups::new(Arc::clone(&self.invoker))
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(Arc::clone(&self.invoker))
    }

    /// A valid session, authenticating first if needed
    pub async fn session(&self) -> Result<Arc<Session>> {
        self.auth.ensure_valid().await
    }

    /// Check whether the configured credentials are accepted
    pub async fn check_auth(&self) -> AuthStatus {
        match self.auth.ensure_valid().await {
            Ok(session) => AuthStatus::ok(format!(
                "{} @ {} ({})",
                session.username(),
                self.config.controller_url(),
                self.config.mode()
            )),
            Err(e) => AuthStatus::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api;
    use crate::config::AuthMode;
    use crate::mock::{MockReply, MockTransport};

    fn config() -> CredentialConfig {
        CredentialConfig::builder()
            .controller_url("https://ctl.example.com")
            .mode(AuthMode::Legacy)
            .legacy_user("admin")
            .legacy_password("secret")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_check_auth() {
        let mock = MockTransport::new();
        mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"));
        let status = DecsClient::with_transport(config(), Arc::new(mock.clone()))
            .check_auth()
            .await;
        assert!(status.authenticated);
        assert_eq!(
            status.account_info.as_deref(),
            Some("admin @ https://ctl.example.com (legacy)")
        );

        let rejecting = MockTransport::new();
        rejecting.on(api::LEGACY_LOGIN_API, MockReply::status(403, "denied"));
        let status = DecsClient::with_transport(config(), Arc::new(rejecting))
            .check_auth()
            .await;
        assert!(!status.authenticated);
        assert!(status.error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_clones_share_session() {
        let mock = MockTransport::new();
        mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"));
        let client = DecsClient::with_transport(config(), Arc::new(mock.clone()));
        let clone = client.clone();

        client.session().await.unwrap();
        clone.session().await.unwrap();
        assert_eq!(mock.call_count(api::LEGACY_LOGIN_API), 1);
    }
}
