//! Compound VM provisioning
//!
//! The controller has no multi-resource transactions, so a machine is stood up as a sequence
//! of dependent calls:
//!
//! ```text
//! Start -> BaseCreated -> ContextResolved -> DisksProvisioned
//!       -> NetworksProvisioned -> PortForwardsProvisioned -> Done
//! ```
//!
//! Only the base create is fatal. Each later group (disks, networks, port forwards) succeeds or
//! fails on its own and is reported in [`ProvisioningOutcome`]; nothing is rolled back. A caller
//! that sees a failed group re-drives the same spec and only the missing pieces are created.

use crate::api::{self, MachineDetailsRecord, MachineRecord, PortForwardRecord};
use crate::error::{DecsError, Result};
use crate::invoker::{ApiInvoker, CallTimeout, FormParams};
use crate::machine::{DiskSpec, MachineSnapshot, MachineSpec, NetworkSpec, PortForwardSpec};
use crate::resgroup::{ResourceGroupContext, ResourceGroups};
use decs_cloud::{ActionType, ApplyResult};
use std::sync::Arc;
use std::time::Instant;

/// Progress of one create or reconcile call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Start,
    BaseCreated,
    ContextResolved,
    DisksProvisioned,
    NetworksProvisioned,
    PortForwardsProvisioned,
    Done,
    /// The base machine exists but at least one group failed
    PartiallyFailed,
}

/// Result of a delete that tolerates absence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Which parts of a compound machine exist after a create or reconcile call.
///
/// A group that was not requested counts as provisioned.
#[derive(Debug, Clone)]
pub struct ProvisioningOutcome {
    pub base_created: bool,
    pub assigned_id: Option<u64>,
    pub disk_step_ok: bool,
    pub network_step_ok: bool,
    pub port_forward_step_ok: bool,
    pub state: ProvisioningState,
    /// Every call made, in order
    pub log: ApplyResult,
}

impl ProvisioningOutcome {
    fn started() -> Self {
        Self {
            base_created: false,
            assigned_id: None,
            disk_step_ok: false,
            network_step_ok: false,
            port_forward_step_ok: false,
            state: ProvisioningState::Start,
            log: ApplyResult::new(),
        }
    }

    /// Every requested group is in place
    pub fn is_complete(&self) -> bool {
        self.base_created && self.disk_step_ok && self.network_step_ok && self.port_forward_step_ok
    }

    /// Names of the groups a re-drive still has to provision
    pub fn pending_groups(&self) -> Vec<&'static str> {
        [
            (!self.base_created, "machine"),
            (!self.disk_step_ok, "disks"),
            (!self.network_step_ok, "networks"),
            (!self.port_forward_step_ok, "port_forwards"),
        ]
        .into_iter()
        .filter(|(pending, _)| *pending)
        .map(|(_, name)| name)
        .collect()
    }

    /// Turn a degraded outcome into [`DecsError::PartialProvisioning`]
    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(DecsError::PartialProvisioning {
                outcome: Box::new(self),
            })
        }
    }
}

/// Sub-resources one call still has to provision
struct GroupPlan {
    disks: Vec<DiskSpec>,
    network: Option<NetworkSpec>,
    port_forwards: Vec<PortForwardSpec>,
    /// Requested rules whose presence could not be checked; never created blindly
    unverified_port_forwards: Vec<PortForwardSpec>,
}

impl GroupPlan {
    fn full(spec: &MachineSpec) -> Self {
        if spec.networks.len() > 1 {
            tracing::warn!(
                "Machine '{}' requests {} networks; only '{}' is attached",
                spec.name,
                spec.networks.len(),
                spec.networks[0].label
            );
        }

        Self {
            disks: spec.data_disks.clone(),
            network: spec.networks.first().cloned(),
            port_forwards: spec.port_forwards.clone(),
            unverified_port_forwards: Vec::new(),
        }
    }

    fn missing(spec: &MachineSpec, snapshot: &MachineSnapshot) -> Self {
        let full = Self::full(spec);
        let (port_forwards, unverified_port_forwards) = if snapshot.port_forwards_known {
            let missing = full
                .port_forwards
                .into_iter()
                .filter(|pf| !snapshot.has_port_forward(pf))
                .collect();
            (missing, Vec::new())
        } else {
            (Vec::new(), full.port_forwards)
        };

        Self {
            disks: full
                .disks
                .into_iter()
                .filter(|d| !snapshot.has_disk(&d.label))
                .collect(),
            network: full.network.filter(|n| !snapshot.has_network(n.network_id)),
            port_forwards,
            unverified_port_forwards,
        }
    }

    /// Disks still to be created and port forwards both need the resource group context
    fn needs_context(&self) -> bool {
        self.disks.iter().any(|d| d.disk_id.is_none()) || !self.port_forwards.is_empty()
    }
}

/// Creates, inspects and destroys compound machines
#[derive(Clone)]
pub struct ProvisioningOrchestrator {
    invoker: Arc<ApiInvoker>,
    resource_groups: ResourceGroups,
}

impl ProvisioningOrchestrator {
    pub fn new(invoker: Arc<ApiInvoker>) -> Self {
        let resource_groups = ResourceGroups::new(Arc::clone(&invoker));
        Self {
            invoker,
            resource_groups,
        }
    }

    /// Create the machine described by `spec` and provision its groups.
    ///
    /// Fails only when the base machine cannot be created. A spec that already carries an
    /// assigned ID is re-driven through [`ProvisioningOrchestrator::reconcile`] instead.
    pub async fn create(&self, spec: &mut MachineSpec) -> Result<ProvisioningOutcome> {
        if spec.assigned_id.is_some() {
            return self.reconcile(spec).await;
        }

        let start = Instant::now();
        let mut outcome = ProvisioningOutcome::started();

        tracing::info!(
            "Creating machine '{}' in resource group {}",
            spec.name,
            spec.resgroup_id
        );
        let params = spec.create_params()?;
        let machine_id = match self.create_base(&params).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Creating machine '{}' failed: {}", spec.name, e);
                return Err(e);
            }
        };

        let machine_id = *spec.assigned_id.get_or_insert(machine_id);
        outcome.base_created = true;
        outcome.assigned_id = Some(machine_id);
        outcome.state = ProvisioningState::BaseCreated;
        outcome.log.add_success(
            ActionType::Create,
            format!("machine:{}", spec.name),
            format!("machine {} created", machine_id),
        );

        let plan = GroupPlan::full(spec);
        self.provision_groups(spec, machine_id, plan, &mut outcome).await;

        Ok(finish(outcome, start, &spec.name))
    }

    /// Provision whatever groups of an existing machine are missing on the controller
    pub async fn reconcile(&self, spec: &mut MachineSpec) -> Result<ProvisioningOutcome> {
        let machine_id = spec.assigned_id.ok_or_else(|| {
            DecsError::InvalidConfig(format!(
                "machine '{}' has no assigned ID to reconcile",
                spec.name
            ))
        })?;

        let start = Instant::now();
        let snapshot = self.describe(machine_id).await?;
        let mut outcome = ProvisioningOutcome::started();
        outcome.base_created = true;
        outcome.assigned_id = Some(machine_id);
        outcome.state = ProvisioningState::BaseCreated;

        let plan = GroupPlan::missing(spec, &snapshot);
        tracing::info!(
            "Reconciling machine {}: {} disk(s), {} network(s), {} port forward(s) missing",
            machine_id,
            plan.disks.len(),
            usize::from(plan.network.is_some()),
            plan.port_forwards.len()
        );
        self.provision_groups(spec, machine_id, plan, &mut outcome).await;

        Ok(finish(outcome, start, &spec.name))
    }

    /// Current server-side state of a machine and the port forwards targeting it.
    ///
    /// Only the machine read is fatal. When its port forwards cannot be listed the snapshot
    /// comes back with `port_forwards_known` unset.
    pub async fn describe(&self, machine_id: u64) -> Result<MachineSnapshot> {
        let params = FormParams::new().with("machineId", machine_id);
        let body = self
            .invoker
            .post(api::MACHINE_GET_API, &params, CallTimeout::Read)
            .await
            .map_err(|e| machine_not_found(e, machine_id))?;
        let record: MachineDetailsRecord = api::decode(api::MACHINE_GET_API, &body)?;

        let port_forwards = match self.port_forwards_of(record.resgroup_id, machine_id).await {
            Ok(rules) => Some(rules),
            Err(e) => {
                tracing::warn!("Cannot list port forwards of machine {}: {}", machine_id, e);
                None
            }
        };

        Ok(MachineSnapshot::from_records(record, port_forwards))
    }

    /// Permanently delete a machine; an absent machine counts as deleted
    pub async fn destroy(&self, machine_id: u64) -> Result<DestroyOutcome> {
        let params = FormParams::new().with("machineId", machine_id);
        match self
            .invoker
            .post(api::MACHINE_GET_API, &params, CallTimeout::Read)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!("Machine {} already absent", machine_id);
                return Ok(DestroyOutcome::AlreadyAbsent);
            }
            Err(e) => return Err(e),
        }

        tracing::info!("Deleting machine {}", machine_id);
        let params = params.with("permanently", 1);
        match self
            .invoker
            .post(api::MACHINE_DELETE_API, &params, CallTimeout::Default)
            .await
        {
            Ok(_) => Ok(DestroyOutcome::Deleted),
            Err(e) if e.is_not_found() => Ok(DestroyOutcome::AlreadyAbsent),
            Err(e) => Err(e),
        }
    }

    /// ID of the machine called `name` in a resource group
    pub async fn find_by_name(&self, resgroup_id: u64, name: &str) -> Result<Option<u64>> {
        let params = FormParams::new().with("cloudspaceId", resgroup_id);
        let body = self
            .invoker
            .post(api::MACHINE_LIST_API, &params, CallTimeout::Read)
            .await?;
        let machines: Vec<MachineRecord> = api::decode(api::MACHINE_LIST_API, &body)?;
        Ok(machines.into_iter().find(|m| m.name == name).map(|m| m.id))
    }

    async fn port_forwards_of(
        &self,
        resgroup_id: u64,
        machine_id: u64,
    ) -> Result<Vec<PortForwardRecord>> {
        // no external IP, no rules to list
        match self.resource_groups.context(resgroup_id).await {
            Ok(ctx) if ctx.external_ip.is_empty() => return Ok(Vec::new()),
            Ok(_) => {}
            Err(e) => tracing::debug!("Resource group {} lookup failed: {}", resgroup_id, e),
        }

        let params = FormParams::new().with("cloudspaceId", resgroup_id);
        let body = self
            .invoker
            .post(api::PORTFORWARD_LIST_API, &params, CallTimeout::Read)
            .await?;
        let rules: Vec<PortForwardRecord> = api::decode(api::PORTFORWARD_LIST_API, &body)?;
        Ok(rules
            .into_iter()
            .filter(|pf| pf.machine_id == machine_id)
            .collect())
    }

    async fn create_base(&self, params: &FormParams) -> Result<u64> {
        let body = self
            .invoker
            .post(api::MACHINE_CREATE_API, params, CallTimeout::Create)
            .await?;
        api::decode_id(api::MACHINE_CREATE_API, &body)
    }

    async fn provision_groups(
        &self,
        spec: &mut MachineSpec,
        machine_id: u64,
        plan: GroupPlan,
        outcome: &mut ProvisioningOutcome,
    ) {
        let context = if plan.needs_context() {
            self.resolve_context(spec, outcome).await
        } else {
            None
        };

        outcome.disk_step_ok = self
            .provision_disks(spec, machine_id, &plan.disks, context.as_ref(), outcome)
            .await;
        if outcome.disk_step_ok {
            outcome.state = ProvisioningState::DisksProvisioned;
        }

        outcome.network_step_ok = self
            .provision_network(machine_id, plan.network.as_ref(), outcome)
            .await;
        if outcome.network_step_ok && outcome.disk_step_ok {
            outcome.state = ProvisioningState::NetworksProvisioned;
        }

        let rules_ok = self
            .provision_port_forwards(
                spec.resgroup_id,
                machine_id,
                &plan.port_forwards,
                context.as_ref(),
                outcome,
            )
            .await;
        for rule in &plan.unverified_port_forwards {
            outcome.log.add_failure(
                ActionType::Lookup,
                format!("port_forward:{}", rule.label),
                "existing port forwards could not be listed".to_string(),
            );
        }
        outcome.port_forward_step_ok = rules_ok && plan.unverified_port_forwards.is_empty();
        if outcome.is_complete() {
            outcome.state = ProvisioningState::PortForwardsProvisioned;
        }
    }

    async fn resolve_context(
        &self,
        spec: &mut MachineSpec,
        outcome: &mut ProvisioningOutcome,
    ) -> Option<ResourceGroupContext> {
        let action_id = format!("resgroup:{}", spec.resgroup_id);
        match self.resource_groups.context(spec.resgroup_id).await {
            Ok(ctx) => {
                spec.tenant_id.get_or_insert(ctx.tenant_id);
                spec.grid_id.get_or_insert(ctx.grid_id);
                if !ctx.external_ip.is_empty() {
                    spec.external_ip.get_or_insert_with(|| ctx.external_ip.clone());
                }
                outcome.state = ProvisioningState::ContextResolved;
                outcome.log.add_success(
                    ActionType::Lookup,
                    action_id,
                    format!("tenant {}, grid {}", ctx.tenant_id, ctx.grid_id),
                );
                Some(ctx)
            }
            Err(e) => {
                tracing::warn!(
                    "Cannot resolve resource group {} for machine '{}': {}",
                    spec.resgroup_id,
                    spec.name,
                    e
                );
                outcome.log.add_failure(ActionType::Lookup, action_id, e.to_string());
                None
            }
        }
    }

    /// Create and attach each disk. A disk that was created on an earlier pass but never
    /// attached keeps its ID in `spec` and is only attached.
    async fn provision_disks(
        &self,
        spec: &mut MachineSpec,
        machine_id: u64,
        disks: &[DiskSpec],
        context: Option<&ResourceGroupContext>,
        outcome: &mut ProvisioningOutcome,
    ) -> bool {
        let mut all_ok = true;
        for disk in disks {
            let action_id = format!("disk:{}", disk.label);
            let disk_id = match (disk.disk_id, context) {
                (Some(id), _) => {
                    tracing::debug!("Disk '{}' exists as {}; attaching it", disk.label, id);
                    id
                }
                (None, Some(ctx)) => {
                    let created = self.create_disk(&spec.name, disk, ctx).await;
                    match created {
                        Ok(id) => {
                            if let Some(wanted) =
                                spec.data_disks.iter_mut().find(|d| d.label == disk.label)
                            {
                                wanted.disk_id = Some(id);
                            }
                            outcome.log.add_success(
                                ActionType::Create,
                                action_id.clone(),
                                format!("disk {} created", id),
                            );
                            id
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Creating disk '{}' of machine {} failed: {}",
                                disk.label,
                                machine_id,
                                e
                            );
                            outcome.log.add_failure(ActionType::Create, action_id, e.to_string());
                            all_ok = false;
                            continue;
                        }
                    }
                }
                (None, None) => {
                    outcome.log.add_failure(
                        ActionType::Create,
                        action_id,
                        "resource group context unavailable".to_string(),
                    );
                    all_ok = false;
                    continue;
                }
            };

            let params = FormParams::new()
                .with("machineId", machine_id)
                .with("diskId", disk_id);
            match self
                .invoker
                .post(api::DISK_ATTACH_API, &params, CallTimeout::Default)
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        "Attached disk '{}' ({}) to machine {}",
                        disk.label,
                        disk_id,
                        machine_id
                    );
                    outcome.log.add_success(
                        ActionType::Attach,
                        action_id,
                        format!("disk {} attached", disk_id),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Attaching disk '{}' to machine {} failed: {}",
                        disk.label,
                        machine_id,
                        e
                    );
                    outcome.log.add_failure(ActionType::Attach, action_id, e.to_string());
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    async fn create_disk(
        &self,
        machine_name: &str,
        disk: &DiskSpec,
        ctx: &ResourceGroupContext,
    ) -> Result<u64> {
        let params = disk.create_params(ctx.tenant_id, ctx.grid_id, machine_name);
        let body = self
            .invoker
            .post(api::DISK_CREATE_API, &params, CallTimeout::Create)
            .await?;
        api::decode_id(api::DISK_CREATE_API, &body)
    }

    async fn provision_network(
        &self,
        machine_id: u64,
        network: Option<&NetworkSpec>,
        outcome: &mut ProvisioningOutcome,
    ) -> bool {
        let Some(network) = network else {
            return true;
        };

        let action_id = format!("network:{}", network.label);
        match self
            .invoker
            .post(
                api::EXTNET_ATTACH_API,
                &network.attach_params(machine_id),
                CallTimeout::Default,
            )
            .await
        {
            Ok(_) => {
                tracing::info!(
                    "Attached external network {} to machine {}",
                    network.network_id,
                    machine_id
                );
                outcome.log.add_success(
                    ActionType::Attach,
                    action_id,
                    format!("external network {} attached", network.network_id),
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Network '{}' of machine {} failed: {}",
                    network.label,
                    machine_id,
                    e
                );
                outcome.log.add_failure(ActionType::Attach, action_id, e.to_string());
                false
            }
        }
    }

    async fn provision_port_forwards(
        &self,
        resgroup_id: u64,
        machine_id: u64,
        rules: &[PortForwardSpec],
        context: Option<&ResourceGroupContext>,
        outcome: &mut ProvisioningOutcome,
    ) -> bool {
        if rules.is_empty() {
            return true;
        }
        let ext_ip = match context {
            Some(ctx) if !ctx.external_ip.is_empty() => ctx.external_ip.as_str(),
            _ => {
                for rule in rules {
                    outcome.log.add_failure(
                        ActionType::Create,
                        format!("port_forward:{}", rule.label),
                        "resource group external IP unavailable".to_string(),
                    );
                }
                return false;
            }
        };

        let mut all_ok = true;
        for rule in rules {
            let action_id = format!("port_forward:{}", rule.label);
            let params = rule.create_params(resgroup_id, ext_ip, machine_id);
            match self
                .invoker
                .post(api::PORTFORWARD_CREATE_API, &params, CallTimeout::Default)
                .await
            {
                Ok(_) => {
                    outcome.log.add_success(
                        ActionType::Create,
                        action_id,
                        format!("{}:{}/{} -> {}", ext_ip, rule.ext_port, rule.proto, rule.int_port),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Port forward '{}' of machine {} failed: {}",
                        rule.label,
                        machine_id,
                        e
                    );
                    outcome.log.add_failure(ActionType::Create, action_id, e.to_string());
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}

fn finish(mut outcome: ProvisioningOutcome, start: Instant, name: &str) -> ProvisioningOutcome {
    outcome.log.duration_ms = start.elapsed().as_millis() as u64;
    if outcome.is_complete() {
        outcome.state = ProvisioningState::Done;
        tracing::info!("Machine '{}' provisioned: {}", name, outcome.log);
    } else {
        outcome.state = ProvisioningState::PartiallyFailed;
        tracing::warn!(
            "Machine '{}' provisioned partially ({}); pending: {}",
            name,
            outcome.log,
            outcome.pending_groups().join(", ")
        );
    }
    outcome
}

fn machine_not_found(err: DecsError, machine_id: u64) -> DecsError {
    if err.is_not_found() {
        DecsError::NotFound(format!("machine {}", machine_id))
    } else {
        err
    }
}
