//! Per-call apply log for multi-step provisioning

use serde::{Deserialize, Serialize};

/// Type of a single control-plane action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Attach an existing resource to another one
    Attach,
    /// Read-only lookup that later actions depend on
    Lookup,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Attach => write!(f, "attach"),
            ActionType::Lookup => write!(f, "lookup"),
        }
    }
}

/// Result of applying a sequence of actions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Successfully applied actions
    pub succeeded: Vec<ActionResult>,

    /// Failed actions
    pub failed: Vec<ActionResult>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl ApplyResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn add_success(&mut self, action_type: ActionType, action_id: String, message: String) {
        self.succeeded.push(ActionResult {
            action_type,
            action_id,
            success: true,
            message,
            error: None,
        });
    }

    pub fn add_failure(&mut self, action_type: ActionType, action_id: String, error: String) {
        self.failed.push(ActionResult {
            action_type,
            action_id,
            success: false,
            message: String::new(),
            error: Some(error),
        });
    }

    /// Whether an action with this ID failed
    pub fn has_failed(&self, action_id: &str) -> bool {
        self.failed.iter().any(|a| a.action_id == action_id)
    }
}

impl std::fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed in {}ms",
            self.succeeded.len(),
            self.failed.len(),
            self.duration_ms
        )
    }
}

/// Result of a single action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// What kind of action this was
    pub action_type: ActionType,

    /// ID of the action (e.g. "attach-disk:data")
    pub action_id: String,

    /// Whether the action succeeded
    pub success: bool,

    /// Success message
    pub message: String,

    /// Error message if failed
    pub error: Option<String>,
}
