//! Resource groups (cloudspaces)

use crate::api::{self, QuotaRecord, ResgroupDetailsRecord, ResgroupRecord};
use crate::error::{DecsError, Result};
use crate::invoker::{ApiInvoker, CallTimeout, FormParams};
use crate::orchestrator::DestroyOutcome;
use decs_cloud::{
    FromResourceConfig, IntoResourceState, ResourceConfig, ResourceState, ResourceStatus,
};
use serde_json::json;
use std::sync::Arc;

/// Resource type name used in attribute bags
pub const RESGROUP_RESOURCE_TYPE: &str = "decs_resgroup";

/// Quota value meaning "no limit"
pub const UNLIMITED: i64 = -1;

/// Tenant and placement facts the orchestrator needs for disks and port forwards.
///
/// A read-only snapshot, fetched per provisioning operation and never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroupContext {
    pub id: u64,
    pub tenant_id: u64,
    pub grid_id: u64,
    /// Empty when the group has no external network
    pub external_ip: String,
    pub location: String,
}

/// Resource limits of a resource group; [`UNLIMITED`] disables a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResgroupQuota {
    pub cpu: i64,
    /// RAM in MB
    pub ram: i64,
    /// Storage in GB
    pub disk: i64,
    pub net_traffic: i64,
    pub ext_ips: i64,
}

impl Default for ResgroupQuota {
    fn default() -> Self {
        Self {
            cpu: UNLIMITED,
            ram: UNLIMITED,
            disk: UNLIMITED,
            net_traffic: UNLIMITED,
            ext_ips: UNLIMITED,
        }
    }
}

impl From<QuotaRecord> for ResgroupQuota {
    fn from(record: QuotaRecord) -> Self {
        // the controller reports quotas as floats; fractions are dropped
        Self {
            cpu: record.cpu as i64,
            ram: record.ram as i64,
            disk: record.disk as i64,
            net_traffic: record.net_traffic as i64,
            ext_ips: record.ext_ips as i64,
        }
    }
}

impl ResgroupQuota {
    fn push_params(&self, params: &mut FormParams) {
        params.push("maxCPUCapacity", self.cpu);
        params.push("maxMemoryCapacity", self.ram);
        params.push("maxVDiskCapacity", self.disk);
        params.push("maxNetworkPeerTransfer", self.net_traffic);
        params.push("maxNumPublicIP", self.ext_ips);
    }
}

impl FromResourceConfig for ResgroupQuota {
    fn from_resource(config: &ResourceConfig) -> decs_cloud::Result<Self> {
        Ok(Self {
            cpu: config.get_or("cpu", UNLIMITED)?,
            ram: config.get_or("ram", UNLIMITED)?,
            disk: config.get_or("disk", UNLIMITED)?,
            net_traffic: config.get_or("net_traffic", UNLIMITED)?,
            ext_ips: config.get_or("ext_ips", UNLIMITED)?,
        })
    }
}

/// Desired state of a resource group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResgroupSpec {
    pub tenant_id: u64,
    pub name: String,
    pub location: String,
    /// User granted access to the new group
    pub owner: String,
    pub quota: ResgroupQuota,
    pub ext_net_id: Option<u64>,
    /// Private network range, e.g. `192.168.103.0/24`
    pub int_net_range: Option<String>,
}

impl ResgroupSpec {
    fn create_params(&self) -> FormParams {
        let mut params = FormParams::new()
            .with("accountId", self.tenant_id)
            .with("location", &self.location)
            .with("name", &self.name)
            .with("access", &self.owner);
        self.quota.push_params(&mut params);
        if let Some(ext_net_id) = self.ext_net_id {
            params.push("externalnetworkid", ext_net_id);
        }
        if let Some(range) = &self.int_net_range {
            params.push("privatenetwork", range);
        }
        params
    }
}

impl FromResourceConfig for ResgroupSpec {
    fn from_resource(config: &ResourceConfig) -> decs_cloud::Result<Self> {
        let quota = match config.blocks("quotas")?.first() {
            Some(block) => ResgroupQuota::from_resource(block)?,
            None => ResgroupQuota::default(),
        };

        Ok(Self {
            tenant_id: config.require("tenant_id")?,
            name: config.require("name")?,
            location: config.require("location")?,
            owner: config.get_or("owner", String::new())?,
            quota,
            ext_net_id: config.get_config("ext_net_id"),
            int_net_range: config.get_config("int_net_range"),
        })
    }
}

/// Full record of a resource group as returned by `cloudspaces/get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResgroupDetails {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub description: String,
    pub tenant_id: u64,
    pub grid_id: u64,
    pub location: String,
    pub external_ip: String,
    pub public_ip: String,
    pub quota: ResgroupQuota,
}

impl From<ResgroupDetailsRecord> for ResgroupDetails {
    fn from(record: ResgroupDetailsRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            status: record.status,
            description: record.description,
            tenant_id: record.tenant_id,
            grid_id: record.grid_id,
            location: record.location,
            external_ip: record.ext_ip,
            public_ip: record.public_ip,
            quota: record.quotas.into(),
        }
    }
}

impl ResgroupDetails {
    pub fn context(&self) -> ResourceGroupContext {
        ResourceGroupContext {
            id: self.id,
            tenant_id: self.tenant_id,
            grid_id: self.grid_id,
            external_ip: self.external_ip.clone(),
            location: self.location.clone(),
        }
    }
}

impl IntoResourceState for ResgroupDetails {
    fn to_resource_state(&self) -> ResourceState {
        let status = match self.status.to_uppercase().as_str() {
            "CREATED" | "DEPLOYED" => ResourceStatus::Running,
            "DEPLOYING" | "VIRTUAL" => ResourceStatus::Creating,
            "DESTROYING" => ResourceStatus::Deleting,
            "DESTROYED" | "DELETED" => ResourceStatus::Deleted,
            _ => ResourceStatus::Unknown,
        };

        ResourceState::new(self.id.to_string(), RESGROUP_RESOURCE_TYPE)
            .with_status(status)
            .with_attribute("name", json!(self.name))
            .with_attribute("tenant_id", json!(self.tenant_id))
            .with_attribute("grid_id", json!(self.grid_id))
            .with_attribute("location", json!(self.location))
            .with_attribute("public_ip", json!(self.public_ip))
            .with_attribute("description", json!(self.description))
            .with_attribute(
                "quotas",
                json!({
                    "cpu": self.quota.cpu,
                    "ram": self.quota.ram,
                    "disk": self.quota.disk,
                    "net_traffic": self.quota.net_traffic,
                    "ext_ips": self.quota.ext_ips,
                }),
            )
    }
}

/// Resource group operations
#[derive(Clone)]
pub struct ResourceGroups {
    invoker: Arc<ApiInvoker>,
}

impl ResourceGroups {
    pub fn new(invoker: Arc<ApiInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn list(&self) -> Result<Vec<ResgroupRecord>> {
        let body = self
            .invoker
            .post(api::RESGROUP_LIST_API, &FormParams::new(), CallTimeout::Read)
            .await?;
        api::decode(api::RESGROUP_LIST_API, &body)
    }

    pub async fn get(&self, id: u64) -> Result<ResgroupDetails> {
        let params = FormParams::new().with("cloudspaceId", id);
        let body = self
            .invoker
            .post(api::RESGROUP_GET_API, &params, CallTimeout::Read)
            .await
            .map_err(|e| not_found(e, id))?;
        let record: ResgroupDetailsRecord = api::decode(api::RESGROUP_GET_API, &body)?;
        Ok(record.into())
    }

    pub async fn context(&self, id: u64) -> Result<ResourceGroupContext> {
        let details = self.get(id).await?;
        tracing::debug!(
            "Resource group {}: tenant {}, grid {}, external IP '{}'",
            id,
            details.tenant_id,
            details.grid_id,
            details.external_ip
        );
        Ok(details.context())
    }

    /// Look a resource group up by its name and the name of its tenant
    pub async fn find(&self, name: &str, tenant_name: &str) -> Result<Option<ResgroupRecord>> {
        let groups = self.list().await?;
        Ok(groups
            .into_iter()
            .find(|rg| rg.name == name && rg.tenant_name == tenant_name))
    }

    pub async fn create(&self, spec: &ResgroupSpec) -> Result<u64> {
        tracing::info!("Creating resource group '{}' for tenant {}", spec.name, spec.tenant_id);
        let body = self
            .invoker
            .post(api::RESGROUP_CREATE_API, &spec.create_params(), CallTimeout::Create)
            .await?;
        api::decode_id(api::RESGROUP_CREATE_API, &body)
    }

    /// Rename a resource group and reset its quotas
    pub async fn update(&self, id: u64, name: &str, quota: &ResgroupQuota) -> Result<()> {
        let mut params = FormParams::new().with("cloudspaceId", id).with("name", name);
        quota.push_params(&mut params);
        self.invoker
            .post(api::RESGROUP_UPDATE_API, &params, CallTimeout::Default)
            .await
            .map_err(|e| not_found(e, id))?;
        Ok(())
    }

    /// Permanently delete a resource group; an absent group counts as deleted
    pub async fn delete(&self, id: u64) -> Result<DestroyOutcome> {
        let params = FormParams::new()
            .with("cloudspaceId", id)
            .with("permanently", 1);
        match self
            .invoker
            .post(api::RESGROUP_DELETE_API, &params, CallTimeout::Default)
            .await
        {
            Ok(_) => {
                tracing::info!("Deleted resource group {}", id);
                Ok(DestroyOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!("Resource group {} already absent", id);
                Ok(DestroyOutcome::AlreadyAbsent)
            }
            Err(e) => Err(e),
        }
    }
}

fn not_found(err: DecsError, id: u64) -> DecsError {
    if err.is_not_found() {
        DecsError::NotFound(format!("resource group {}", id))
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DecsClient;
    use crate::config::{AuthMode, CredentialConfig};
    use crate::mock::{MockReply, MockTransport};

    fn client(mock: &MockTransport) -> DecsClient {
        let config = CredentialConfig::builder()
            .controller_url("https://ctl.example.com")
            .mode(AuthMode::Legacy)
            .legacy_user("admin")
            .legacy_password("secret")
            .build()
            .unwrap();
        mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"));
        DecsClient::with_transport(config, Arc::new(mock.clone()))
    }

    #[tokio::test]
    async fn test_context_from_get() {
        let mock = MockTransport::new();
        mock.on(
            api::RESGROUP_GET_API,
            MockReply::ok(
                r#"{"id": 12, "accountId": 3, "gid": 212, "externalnetworkip": "185.1.2.3",
                    "location": "ru-msk", "resourceLimits": {"CU_M": 4096.7}}"#,
            ),
        );
        let groups = client(&mock).resource_groups();

        let ctx = groups.context(12).await.unwrap();
        assert_eq!(ctx.tenant_id, 3);
        assert_eq!(ctx.grid_id, 212);
        assert_eq!(ctx.external_ip, "185.1.2.3");
        assert_eq!(mock.calls_to(api::RESGROUP_GET_API)[0].param("cloudspaceId"), Some("12"));

        let details = groups.get(12).await.unwrap();
        assert_eq!(details.quota.ram, 4096);
        assert_eq!(details.quota.cpu, UNLIMITED);
    }

    #[tokio::test]
    async fn test_get_missing_group() {
        let mock = MockTransport::new();
        mock.on(api::RESGROUP_GET_API, MockReply::status(404, "not found"));
        let groups = client(&mock).resource_groups();

        let err = groups.get(99).await.unwrap_err();
        assert!(matches!(err, DecsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_find_matches_name_and_tenant() {
        let mock = MockTransport::new();
        mock.on(
            api::RESGROUP_LIST_API,
            MockReply::ok(
                r#"[{"id": 1, "name": "prod", "accountName": "acme"},
                    {"id": 2, "name": "prod", "accountName": "globex"}]"#,
            ),
        );
        let groups = client(&mock).resource_groups();

        let found = groups.find("prod", "globex").await.unwrap().unwrap();
        assert_eq!(found.id, 2);
        assert!(groups.find("dev", "acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let mock = MockTransport::new();
        mock.on(api::RESGROUP_CREATE_API, MockReply::ok("42"))
            .on(api::RESGROUP_UPDATE_API, MockReply::ok("true"))
            .on(api::RESGROUP_DELETE_API, MockReply::ok("true"))
            .on(api::RESGROUP_DELETE_API, MockReply::status(404, "gone"));
        let groups = client(&mock).resource_groups();

        let spec = ResgroupSpec {
            tenant_id: 3,
            name: "prod".into(),
            location: "ru-msk".into(),
            owner: "admin".into(),
            quota: ResgroupQuota {
                cpu: 16,
                ..Default::default()
            },
            ext_net_id: Some(6),
            int_net_range: None,
        };
        assert_eq!(groups.create(&spec).await.unwrap(), 42);

        let create = &mock.calls_to(api::RESGROUP_CREATE_API)[0];
        assert_eq!(create.param("maxCPUCapacity"), Some("16"));
        assert_eq!(create.param("maxMemoryCapacity"), Some("-1"));
        assert_eq!(create.param("externalnetworkid"), Some("6"));
        assert_eq!(create.param("privatenetwork"), None);

        groups.update(42, "prod-2", &spec.quota).await.unwrap();
        assert_eq!(mock.calls_to(api::RESGROUP_UPDATE_API)[0].param("name"), Some("prod-2"));

        assert_eq!(groups.delete(42).await.unwrap(), DestroyOutcome::Deleted);
        assert_eq!(groups.delete(42).await.unwrap(), DestroyOutcome::AlreadyAbsent);
    }

    #[test]
    fn test_spec_from_bag_defaults_quota() {
        let bag = ResourceConfig::new(
            RESGROUP_RESOURCE_TYPE,
            "prod",
            "decs",
            json!({ "tenant_id": 3, "name": "prod", "location": "ru-msk", "quotas": { "cpu": 8 } }),
        );
        let spec = ResgroupSpec::from_resource(&bag).unwrap();
        assert_eq!(spec.quota.cpu, 8);
        assert_eq!(spec.quota.ram, UNLIMITED);
        assert_eq!(spec.ext_net_id, None);
    }
}
