//! Virtual machine specs and snapshots
//!
//! A [`MachineSpec`] is the desired state of one compound VM resource and the aggregate the
//! orchestrator writes derived state into. A [`MachineSnapshot`] is what the controller
//! reports back for it.

use crate::api::{DiskRecord, GuestLoginRecord, MachineDetailsRecord, NicRecord, PortForwardRecord};
use crate::error::Result;
use crate::invoker::FormParams;
use decs_cloud::{
    CloudError, FromResourceConfig, IntoResourceState, ResourceConfig, ResourceState,
    ResourceStatus,
};
use serde::Serialize;
use serde_json::json;

/// Resource type name used in attribute bags
pub const MACHINE_RESOURCE_TYPE: &str = "decs_vm";

const DEFAULT_POOL: &str = "default";

/// A boot or data disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    /// Unique among the disks of one machine
    pub label: String,
    /// Size in GB
    pub size: u32,
    pub pool: String,
    /// Storage technology serving the disk
    pub provider: String,
    /// Controller ID once the disk exists, attached or not
    pub disk_id: Option<u64>,
}

impl DiskSpec {
    pub fn new(label: impl Into<String>, size: u32) -> Self {
        Self {
            label: label.into(),
            size,
            pool: DEFAULT_POOL.to_string(),
            provider: DEFAULT_POOL.to_string(),
            disk_id: None,
        }
    }

    /// Form of `disks/create` for a data disk owned by `tenant_id` on `grid_id`
    pub fn create_params(&self, tenant_id: u64, grid_id: u64, machine_name: &str) -> FormParams {
        FormParams::new()
            .with("accountId", tenant_id)
            .with("gid", grid_id)
            .with("name", &self.label)
            .with("description", format!("Data disk {} of {}", self.label, machine_name))
            .with("size", self.size)
            .with("type", "D")
            .with("pool", &self.pool)
    }
}

impl FromResourceConfig for DiskSpec {
    fn from_resource(config: &ResourceConfig) -> decs_cloud::Result<Self> {
        Ok(Self {
            label: config.require("label")?,
            size: config.require("size")?,
            pool: config.get_or("pool", DEFAULT_POOL.to_string())?,
            provider: config.get_or("provider", DEFAULT_POOL.to_string())?,
            disk_id: config.get_config("disk_id"),
        })
    }
}

/// An external network to connect the machine to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub label: String,
    pub network_id: u64,
}

impl NetworkSpec {
    pub fn new(label: impl Into<String>, network_id: u64) -> Self {
        Self {
            label: label.into(),
            network_id,
        }
    }

    pub fn attach_params(&self, machine_id: u64) -> FormParams {
        FormParams::new()
            .with("machineId", machine_id)
            .with("externalNetworkId", self.network_id)
    }
}

impl FromResourceConfig for NetworkSpec {
    fn from_resource(config: &ResourceConfig) -> decs_cloud::Result<Self> {
        Ok(Self {
            label: config.require("label")?,
            network_id: config.require("network_id")?,
        })
    }
}

/// A port forwarding rule from the resource group's external IP to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardSpec {
    pub label: String,
    pub ext_port: u16,
    pub int_port: u16,
    /// `tcp` or `udp`
    pub proto: String,
}

impl PortForwardSpec {
    pub fn new(label: impl Into<String>, ext_port: u16, int_port: u16, proto: &str) -> Self {
        Self {
            label: label.into(),
            ext_port,
            int_port,
            proto: proto.to_lowercase(),
        }
    }

    pub fn create_params(&self, resgroup_id: u64, ext_ip: &str, machine_id: u64) -> FormParams {
        FormParams::new()
            .with("cloudspaceId", resgroup_id)
            .with("publicIp", ext_ip)
            .with("publicPort", self.ext_port)
            .with("machineId", machine_id)
            .with("localPort", self.int_port)
            .with("protocol", &self.proto)
    }

    /// Whether `record` is this rule, matched on public port and protocol
    pub fn matches(&self, record: &PortForwardRecord) -> bool {
        record.ext_port.trim() == self.ext_port.to_string()
            && record.proto.eq_ignore_ascii_case(&self.proto)
    }
}

impl FromResourceConfig for PortForwardSpec {
    fn from_resource(config: &ResourceConfig) -> decs_cloud::Result<Self> {
        let proto: String = config.require::<String>("proto")?.to_lowercase();
        if proto != "tcp" && proto != "udp" {
            return Err(CloudError::invalid(
                "proto",
                format!("expected 'tcp' or 'udp', got '{}'", proto),
            ));
        }

        Ok(Self {
            label: config.require("label")?,
            ext_port: config.require("ext_port")?,
            int_port: config.require("int_port")?,
            proto,
        })
    }
}

/// An SSH public key to authorize for a guest OS user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeySpec {
    pub user: String,
    pub public_key: String,
}

impl SshKeySpec {
    pub fn new(user: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            public_key: public_key.into(),
        }
    }
}

impl FromResourceConfig for SshKeySpec {
    fn from_resource(config: &ResourceConfig) -> decs_cloud::Result<Self> {
        Ok(Self {
            user: config.require("user")?,
            public_key: config.require("public_key")?,
        })
    }
}

#[derive(Serialize)]
struct CloudConfig<'a> {
    users: Vec<CloudUser<'a>>,
}

#[derive(Serialize)]
struct CloudUser<'a> {
    name: &'a str,
    ssh_authorized_keys: Vec<&'a str>,
}

/// Cloud-init user data authorizing `keys`, one entry per user in first-seen order
pub fn cloud_init_user_data(keys: &[SshKeySpec]) -> Result<Option<String>> {
    if keys.is_empty() {
        return Ok(None);
    }

    let mut users: Vec<CloudUser<'_>> = Vec::new();
    for key in keys {
        match users.iter_mut().find(|u| u.name == key.user) {
            Some(user) => user.ssh_authorized_keys.push(key.public_key.trim()),
            None => users.push(CloudUser {
                name: &key.user,
                ssh_authorized_keys: vec![key.public_key.trim()],
            }),
        }
    }

    let yaml = serde_yaml::to_string(&CloudConfig { users })
        .map_err(|e| CloudError::invalid("ssh_keys", e.to_string()))?;
    Ok(Some(format!("#cloud-config\n{}", yaml)))
}

/// Desired state of a compound VM resource
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSpec {
    pub resgroup_id: u64,
    pub name: String,
    pub cpu: u32,
    /// RAM in MB
    pub ram: u32,
    pub image_id: u64,
    pub description: String,
    pub boot_disk: DiskSpec,
    pub data_disks: Vec<DiskSpec>,
    pub networks: Vec<NetworkSpec>,
    pub port_forwards: Vec<PortForwardSpec>,
    pub ssh_keys: Vec<SshKeySpec>,

    /// Set once the base create succeeds
    pub assigned_id: Option<u64>,
    /// Set once the resource group context is resolved
    pub tenant_id: Option<u64>,
    pub grid_id: Option<u64>,
    pub external_ip: Option<String>,
}

impl MachineSpec {
    pub fn new(
        resgroup_id: u64,
        name: impl Into<String>,
        cpu: u32,
        ram: u32,
        image_id: u64,
        boot_disk_size: u32,
    ) -> Self {
        Self {
            resgroup_id,
            name: name.into(),
            cpu,
            ram,
            image_id,
            description: String::new(),
            boot_disk: DiskSpec::new("boot", boot_disk_size),
            data_disks: Vec::new(),
            networks: Vec::new(),
            port_forwards: Vec::new(),
            ssh_keys: Vec::new(),
            assigned_id: None,
            tenant_id: None,
            grid_id: None,
            external_ip: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_data_disk(mut self, disk: DiskSpec) -> Self {
        self.data_disks.push(disk);
        self
    }

    pub fn with_network(mut self, network: NetworkSpec) -> Self {
        self.networks.push(network);
        self
    }

    pub fn with_port_forward(mut self, rule: PortForwardSpec) -> Self {
        self.port_forwards.push(rule);
        self
    }

    pub fn with_ssh_key(mut self, key: SshKeySpec) -> Self {
        self.ssh_keys.push(key);
        self
    }

    /// Form of `machines/create`
    pub fn create_params(&self) -> Result<FormParams> {
        let mut params = FormParams::new()
            .with("cloudspaceId", self.resgroup_id)
            .with("name", &self.name)
            .with("description", &self.description)
            .with("vcpus", self.cpu)
            .with("memory", self.ram)
            .with("imageId", self.image_id)
            .with("disksize", self.boot_disk.size);

        if let Some(user_data) = cloud_init_user_data(&self.ssh_keys)? {
            params.push("userdata", user_data);
        }
        Ok(params)
    }
}

impl FromResourceConfig for MachineSpec {
    fn from_resource(config: &ResourceConfig) -> decs_cloud::Result<Self> {
        let boot_disk = config
            .blocks("boot_disk")?
            .first()
            .map(DiskSpec::from_resource)
            .transpose()?
            .ok_or_else(|| CloudError::MissingAttribute("boot_disk".to_string()))?;

        let data_disks = config
            .blocks("disks")?
            .iter()
            .map(DiskSpec::from_resource)
            .collect::<decs_cloud::Result<Vec<_>>>()?;
        let networks = config
            .blocks("networks")?
            .iter()
            .map(NetworkSpec::from_resource)
            .collect::<decs_cloud::Result<Vec<_>>>()?;
        let port_forwards = config
            .blocks("port_forwards")?
            .iter()
            .map(PortForwardSpec::from_resource)
            .collect::<decs_cloud::Result<Vec<_>>>()?;
        let ssh_keys = config
            .blocks("ssh_keys")?
            .iter()
            .map(SshKeySpec::from_resource)
            .collect::<decs_cloud::Result<Vec<_>>>()?;

        Ok(Self {
            resgroup_id: config.require("rgid")?,
            name: config.require("name")?,
            cpu: config.require("cpu")?,
            ram: config.require("ram")?,
            image_id: config.require("image_id")?,
            description: config.get_or("description", String::new())?,
            boot_disk,
            data_disks,
            networks,
            port_forwards,
            ssh_keys,
            assigned_id: config.get_config("id"),
            tenant_id: None,
            grid_id: None,
            external_ip: None,
        })
    }
}

/// Server-side view of a machine and the port forwards that target it
#[derive(Debug, Clone)]
pub struct MachineSnapshot {
    pub id: u64,
    pub name: String,
    pub resgroup_id: u64,
    pub status: String,
    pub cpu: u32,
    pub ram: u32,
    /// Boot disk size in GB
    pub boot_disk_size: u32,
    pub image_id: u64,
    pub image_name: String,
    pub description: String,
    pub hostname: String,
    pub data_disks: Vec<DiskRecord>,
    pub nics: Vec<NicRecord>,
    pub guest_logins: Vec<GuestLoginRecord>,
    pub port_forwards: Vec<PortForwardRecord>,
    /// False when the port forward listing failed and `port_forwards` is empty for that reason
    pub port_forwards_known: bool,
    /// External networks the machine has a NIC on
    pub external_networks: Vec<u64>,
}

impl MachineSnapshot {
    /// `port_forwards` is `None` when the rules could not be listed
    pub fn from_records(
        record: MachineDetailsRecord,
        port_forwards: Option<Vec<PortForwardRecord>>,
    ) -> Self {
        let external_networks = record
            .nics
            .iter()
            .filter_map(NicRecord::external_network_id)
            .collect();
        let data_disks = record.disks.into_iter().filter(|d| !d.is_boot()).collect();

        Self {
            id: record.id,
            name: record.name,
            resgroup_id: record.resgroup_id,
            status: record.status,
            cpu: record.cpu,
            ram: record.ram,
            boot_disk_size: record.boot_disk,
            image_id: record.image_id,
            image_name: record.image_name,
            description: record.description,
            hostname: record.hostname,
            data_disks,
            nics: record.nics,
            guest_logins: record.guest_logins,
            port_forwards_known: port_forwards.is_some(),
            port_forwards: port_forwards.unwrap_or_default(),
            external_networks,
        }
    }

    pub fn has_disk(&self, label: &str) -> bool {
        self.data_disks.iter().any(|d| d.label == label)
    }

    pub fn has_network(&self, network_id: u64) -> bool {
        self.external_networks.contains(&network_id)
    }

    pub fn has_port_forward(&self, rule: &PortForwardSpec) -> bool {
        self.port_forwards.iter().any(|pf| rule.matches(pf))
    }

    pub fn resource_status(&self) -> ResourceStatus {
        match self.status.to_uppercase().as_str() {
            "RUNNING" => ResourceStatus::Running,
            "HALTED" | "STOPPED" | "PAUSED" => ResourceStatus::Stopped,
            "VIRTUAL" | "DEPLOYING" | "CREATED" => ResourceStatus::Creating,
            "DESTROYING" | "DELETING" => ResourceStatus::Deleting,
            "DESTROYED" | "DELETED" => ResourceStatus::Deleted,
            "ERROR" => ResourceStatus::Error,
            _ => ResourceStatus::Unknown,
        }
    }
}

impl IntoResourceState for MachineSnapshot {
    fn to_resource_state(&self) -> ResourceState {
        let disks: Vec<_> = self
            .data_disks
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "label": d.label,
                    "size": d.size_max,
                    "pool": d.pool,
                    "status": d.status,
                })
            })
            .collect();
        let nics: Vec<_> = self
            .nics
            .iter()
            .map(|n| {
                json!({
                    "status": n.status,
                    "type": n.nic_type,
                    "mac": n.mac_address,
                    "ip_address": n.ip_address,
                    "parameters": n.params,
                    "reference_id": n.reference_id,
                    "network_id": n.network_id,
                })
            })
            .collect();
        let port_forwards: Vec<_> = self
            .port_forwards
            .iter()
            .map(|pf| {
                json!({
                    "ext_port": pf.ext_port.parse::<u16>().ok(),
                    "int_port": pf.int_port.parse::<u16>().ok(),
                    "proto": pf.proto,
                    "ext_ip": pf.ext_ip,
                    "int_ip": pf.int_ip,
                })
            })
            .collect();
        let guest_logins: Vec<_> = self
            .guest_logins
            .iter()
            .map(|l| json!({ "guid": l.guid, "login": l.login, "password": l.password }))
            .collect();

        ResourceState::new(self.id.to_string(), MACHINE_RESOURCE_TYPE)
            .with_status(self.resource_status())
            .with_attribute("name", json!(self.name))
            .with_attribute("rgid", json!(self.resgroup_id))
            .with_attribute("cpu", json!(self.cpu))
            .with_attribute("ram", json!(self.ram))
            .with_attribute("boot_disk", json!(self.boot_disk_size))
            .with_attribute("image_id", json!(self.image_id))
            .with_attribute("image_name", json!(self.image_name))
            .with_attribute("description", json!(self.description))
            .with_attribute("hostname", json!(self.hostname))
            .with_attribute("disks", json!(disks))
            .with_attribute("nics", json!(nics))
            .with_attribute("port_forwards", json!(port_forwards))
            .with_attribute("guest_logins", json!(guest_logins))
            .with_attribute("networks", json!(self.external_networks))
    }
}
