//! DECS cloud resource abstractions
//!
//! Provider-agnostic pieces shared by the DECS control-plane client:
//!
//! - **Attribute bags**: `ResourceConfig` in, `ResourceState` out. These are the only shapes the
//!   hosting orchestration tool sees; typed specs are built from them through
//!   [`FromResourceConfig`] and flattened back through [`IntoResourceState`].
//! - **Retry policy**: bounded exponential backoff for transient failures.
//! - **Apply log**: per-action success/failure records for multi-step provisioning.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │        hosting orchestration tool (external)     │
//! └─────────────────┬───────────────────────────────┘
//!                   │ ResourceConfig / ResourceState
//! ┌─────────────────▼───────────────────────────────┐
//! │                  decs-cloud                      │
//! │  FromResourceConfig   IntoResourceState          │
//! │  RetryConfig          ApplyResult                │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                decs-controller                   │
//! │  auth · invoker · orchestrator · resource groups │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod action;
pub mod error;
pub mod provider;
pub mod state;

// Re-exports
pub use action::{ActionResult, ActionType, ApplyResult};
pub use error::{CloudError, Result};
pub use provider::{AuthStatus, FromResourceConfig, IntoResourceState, ResourceConfig, RetryConfig};
pub use state::{ResourceState, ResourceStatus};
