//! DECS cloud controller client
//!
//! Authenticates against a DECS cloud controller and provisions compound virtual machines:
//! a machine plus its data disks, external network attachment and port forwarding rules.
//!
//! # Features
//!
//! - Three authentication modes: legacy user/password, OAuth2 application credentials, JWT
//! - One cached session per client, refreshed lazily and at most once per call on rejection
//! - Bounded retry with backoff for transport failures
//! - Per-group provisioning outcome, so a failed group is re-driven without recreating the machine
//! - Resource group, image and external network lookups
//!
//! # Example
//!
//! ```ignore
//! use decs_controller::{CredentialConfig, DecsClient, DiskSpec, MachineSpec};
//!
//! let client = DecsClient::new(CredentialConfig::from_env()?)?;
//!
//! let mut spec = MachineSpec::new(12, "web-01", 2, 2048, 7, 20)
//!     .with_data_disk(DiskSpec::new("data", 50));
//! let outcome = client.orchestrator().create(&mut spec).await?;
//! if !outcome.is_complete() {
//!     tracing::warn!("pending: {:?}", outcome.pending_groups());
//! }
//! ```

pub mod api;
pub mod auth;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod invoker;
pub mod machine;
pub mod orchestrator;
pub mod resgroup;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use auth::{AuthManager, Session, TokenKind};
pub use catalog::Catalog;
pub use client::DecsClient;
pub use config::{AuthMode, CredentialConfig, CredentialConfigBuilder};
pub use error::{AuthFailure, DecsError, Result};
pub use invoker::{ApiInvoker, CallTimeout, FormParams};
pub use machine::{
    DiskSpec, MachineSnapshot, MachineSpec, NetworkSpec, PortForwardSpec, SshKeySpec,
};
pub use orchestrator::{
    DestroyOutcome, ProvisioningOrchestrator, ProvisioningOutcome, ProvisioningState,
};
pub use resgroup::{
    ResgroupDetails, ResgroupQuota, ResgroupSpec, ResourceGroupContext, ResourceGroups,
};
pub use transport::{HttpReply, HttpRequest, ReqwestTransport, Transport, TransportError};
