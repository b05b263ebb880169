//! # Custom Resource Definitions
//!
//! Typed definitions of the `Machine` and `NixosConfiguration` resources in
//! the `nio.homystack.com/v1alpha1` group, plus the shared condition type
//! and the status patch builders used for all writes to the status
//! subresource.
//!
//! ## Module Structure
//!
//! - `machine.rs` - Machine spec, status, and status patch builder
//! - `configuration.rs` - NixosConfiguration spec, status, and patch builder

pub mod configuration;
pub mod machine;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use configuration::{
    AdditionalFile, AdditionalFileValue, ConfigurationStatusPatch, MachineRef, NixosConfiguration,
    NixosConfigurationSpec, NixosConfigurationStatus,
};
pub use machine::{
    Machine, MachineSpec, MachineStatus, MachineStatusPatch, PasswordSecretRef, SecretRef,
};

/// API group shared by both resources.
pub const API_GROUP: &str = "nio.homystack.com";
/// API version shared by both resources.
pub const API_VERSION: &str = "v1alpha1";

/// Condition type used on `NixosConfiguration.status.conditions`.
pub const CONDITION_APPLIED: &str = "Applied";

/// Status condition recording the outcome of a reconcile.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (always `Applied` for configurations).
    pub r#type: String,
    /// Status of condition (True, False, Unknown).
    pub status: String,
    /// Last transition time.
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for condition.
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing condition.
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    /// Build an `Applied` condition stamped with the current time.
    pub fn applied(status: bool, reason: &str, message: &str) -> Self {
        Self {
            r#type: CONDITION_APPLIED.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applied_condition_shape() {
        let cond = Condition::applied(true, "Success", "Configuration successfully applied");
        assert_eq!(cond.r#type, "Applied");
        assert_eq!(cond.status, "True");
        assert!(cond.is_true());
        assert_eq!(cond.reason.as_deref(), Some("Success"));
        assert!(cond.last_transition_time.is_some());
    }

    #[test]
    fn failed_condition_shape() {
        let cond = Condition::applied(false, "ValidationError", "hostname contains ';'");
        assert_eq!(cond.status, "False");
        assert!(!cond.is_true());
    }

    #[test]
    fn serializes_camel_case() {
        let cond = Condition::applied(true, "Success", "ok");
        let value = serde_json::to_value(&cond).unwrap();
        assert!(value.get("lastTransitionTime").is_some());
        assert!(value.get("type").is_some());
    }
}
