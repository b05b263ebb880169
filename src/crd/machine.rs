//! Machine custom resource: a managed NixOS host reachable over SSH.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Reference to a secret holding an SSH private key under `ssh-privatekey`.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name.
    pub name: String,
    /// Secret namespace; defaults to the resource's own namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Reference to a secret holding an SSH password.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSecretRef {
    /// Secret name.
    pub name: String,
    /// Secret namespace; defaults to the resource's own namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Key inside the secret; defaults to `password`.
    #[serde(default)]
    pub key: Option<String>,
}

/// Machine Custom Resource Definition
///
/// Declarative description of a managed host. Machines are created by users
/// or by the PXE bootstrapper; only the controller mutates the status.
/// Deleting a Machine does not touch the host itself.
///
/// # Example
///
/// ```yaml
/// apiVersion: nio.homystack.com/v1alpha1
/// kind: Machine
/// metadata:
///   name: mach-a
///   namespace: default
/// spec:
///   hostname: 10.0.0.5
///   sshUser: root
///   sshKeySecretRef:
///     name: keys-a
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Machine",
    group = "nio.homystack.com",
    version = "v1alpha1",
    namespaced,
    status = "MachineStatus",
    printcolumn = r#"{"name":"Hostname", "type":"string", "jsonPath":".spec.hostname"}"#,
    printcolumn = r#"{"name":"Discoverable", "type":"boolean", "jsonPath":".status.discoverable"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Hostname or IP address used as the SSH target.
    pub hostname: String,
    /// Explicit IP address; preferred over `hostname` for apply commands
    /// when set.
    #[serde(default)]
    pub ip_address: Option<String>,
    /// SSH user, defaults to `root`.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Secret with an `ssh-privatekey` entry.
    #[serde(default)]
    pub ssh_key_secret_ref: Option<SecretRef>,
    /// Secret with a password entry (key configurable, defaults to
    /// `password`). Used when no key is available.
    #[serde(default)]
    pub ssh_password_secret_ref: Option<PasswordSecretRef>,
    /// MAC address recorded by the PXE bootstrapper.
    #[serde(default)]
    pub mac_address: Option<String>,
}

pub fn default_ssh_user() -> String {
    "root".to_string()
}

impl MachineSpec {
    /// Host actually targeted by apply commands: explicit IP wins.
    pub fn target_host(&self) -> &str {
        self.ip_address.as_deref().unwrap_or(&self.hostname)
    }
}

/// Status of a Machine, owned by the machine reconciler.
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Whether the last SSH reachability probe succeeded.
    #[serde(default)]
    pub discoverable: Option<bool>,
    /// Whether a NixosConfiguration is currently applied.
    #[serde(default)]
    pub has_configuration: Option<bool>,
    /// Name of the applied NixosConfiguration, if any.
    #[serde(default)]
    pub applied_configuration: Option<String>,
    /// Commit applied by that configuration.
    #[serde(default)]
    pub applied_commit: Option<String>,
    /// RFC3339 time of the last successful apply.
    #[serde(default)]
    pub last_applied_time: Option<String>,
    /// Two-level hardware facts mapping from the last scan.
    #[serde(default)]
    pub hardware_facts: Option<std::collections::BTreeMap<String, Value>>,
    /// RFC3339 time of the last successful hardware scan.
    #[serde(default)]
    pub last_hardware_scan_time: Option<String>,
}

/// Builder for merge-patches against the Machine status subresource.
///
/// Only the fields explicitly set are included in the patch body, so
/// concurrent writers (discovery probe vs. configuration apply) never
/// clobber each other's fields. `None` setters serialize JSON `null` to
/// clear a field.
#[derive(Debug, Default)]
pub struct MachineStatusPatch(Map<String, Value>);

impl MachineStatusPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discoverable(mut self, value: bool) -> Self {
        self.0.insert("discoverable".into(), json!(value));
        self
    }

    pub fn has_configuration(mut self, value: bool) -> Self {
        self.0.insert("hasConfiguration".into(), json!(value));
        self
    }

    pub fn applied_configuration(mut self, value: Option<&str>) -> Self {
        self.0.insert("appliedConfiguration".into(), json!(value));
        self
    }

    pub fn applied_commit(mut self, value: Option<&str>) -> Self {
        self.0.insert("appliedCommit".into(), json!(value));
        self
    }

    pub fn last_applied_time(mut self, value: &str) -> Self {
        self.0.insert("lastAppliedTime".into(), json!(value));
        self
    }

    pub fn hardware_facts(mut self, facts: Map<String, Value>) -> Self {
        self.0.insert("hardwareFacts".into(), Value::Object(facts));
        self
    }

    pub fn last_hardware_scan_time(mut self, value: &str) -> Self {
        self.0.insert("lastHardwareScanTime".into(), json!(value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `{"status": {...}}` body expected by the status subresource.
    pub fn into_merge_patch(self) -> Value {
        json!({ "status": Value::Object(self.0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_user_defaults_to_root() {
        let spec: MachineSpec =
            serde_json::from_value(json!({ "hostname": "10.0.0.5" })).unwrap();
        assert_eq!(spec.ssh_user, "root");
        assert_eq!(spec.target_host(), "10.0.0.5");
    }

    #[test]
    fn ip_address_wins_as_target() {
        let spec: MachineSpec = serde_json::from_value(json!({
            "hostname": "mach-a.example.com",
            "ipAddress": "10.0.0.5"
        }))
        .unwrap();
        assert_eq!(spec.target_host(), "10.0.0.5");
    }

    #[test]
    fn secret_refs_deserialize_camel_case() {
        let spec: MachineSpec = serde_json::from_value(json!({
            "hostname": "10.0.0.5",
            "sshKeySecretRef": { "name": "keys-a" },
            "sshPasswordSecretRef": { "name": "pw-a", "key": "pass" }
        }))
        .unwrap();
        assert_eq!(spec.ssh_key_secret_ref.unwrap().name, "keys-a");
        let pw = spec.ssh_password_secret_ref.unwrap();
        assert_eq!(pw.key.as_deref(), Some("pass"));
    }

    #[test]
    fn patch_contains_only_set_fields() {
        let patch = MachineStatusPatch::new()
            .discoverable(true)
            .has_configuration(false)
            .into_merge_patch();
        let status = patch.get("status").unwrap();
        assert_eq!(status["discoverable"], json!(true));
        assert_eq!(status["hasConfiguration"], json!(false));
        assert!(status.get("appliedCommit").is_none());
    }

    #[test]
    fn none_setters_clear_fields() {
        let patch = MachineStatusPatch::new()
            .applied_configuration(None)
            .applied_commit(None)
            .into_merge_patch();
        let status = patch.get("status").unwrap();
        assert_eq!(status["appliedConfiguration"], Value::Null);
        assert_eq!(status["appliedCommit"], Value::Null);
    }
}
