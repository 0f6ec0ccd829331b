//! Attribute bag types shared with the hosting orchestration tool

use crate::error::{CloudError, Result};
use crate::state::ResourceState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Builds a typed spec out of a generic attribute bag.
///
/// This is the "bag in" half of the schema boundary: the hosting tool hands over
/// whatever its declarative schema produced and the implementor picks out typed fields.
pub trait FromResourceConfig: Sized {
    fn from_resource(config: &ResourceConfig) -> Result<Self>;
}

/// Flattens a typed server-side view back into a generic attribute bag.
pub trait IntoResourceState {
    fn to_resource_state(&self) -> ResourceState;
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account/user information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}

/// Configuration for a cloud resource, as produced by the declarative schema layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource type (e.g., "decs_vm", "decs_resgroup")
    pub resource_type: String,

    /// Resource identifier (the desired name until the cloud assigns an ID)
    pub id: String,

    /// Provider name
    pub provider: String,

    /// Resource-specific configuration
    pub config: serde_json::Value,
}

impl ResourceConfig {
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        provider: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            provider: provider.into(),
            config,
        }
    }

    /// Get a configuration value as a specific type
    pub fn get_config<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get a required configuration value, failing if it is absent or has the wrong type
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .config
            .get(key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| CloudError::MissingAttribute(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| CloudError::invalid(key, e.to_string()))
    }

    /// Get an optional configuration value, falling back to `default` when absent.
    ///
    /// A present value of the wrong type is still an error.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.config.get(key) {
            None | Some(serde_json::Value::Null) => Ok(default),
            Some(_) => self.require(key),
        }
    }

    /// Get a nested block list (e.g. `disks { ... }` repeated) as child bags.
    ///
    /// An absent key yields an empty list; a single object is treated as a one-element list.
    pub fn blocks(&self, key: &str) -> Result<Vec<ResourceConfig>> {
        let items = match self.config.get(key) {
            None | Some(serde_json::Value::Null) => return Ok(Vec::new()),
            Some(serde_json::Value::Array(items)) => items.clone(),
            Some(obj @ serde_json::Value::Object(_)) => vec![obj.clone()],
            Some(other) => {
                return Err(CloudError::invalid(
                    key,
                    format!("expected a list of blocks, got {}", other),
                ));
            }
        };

        items
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                if !value.is_object() {
                    return Err(CloudError::invalid(
                        format!("{}.{}", key, index),
                        "expected a block",
                    ));
                }
                Ok(ResourceConfig::new(
                    format!("{}.{}", self.resource_type, key),
                    index.to_string(),
                    self.provider.clone(),
                    value,
                ))
            })
            .collect()
    }
}

/// Retry configuration for transient transport failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. Mostly useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after the given (zero-based) failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay as u64).min(self.max_delay)
    }
}
