//! NixosConfiguration custom resource: declarative intent to apply a
//! flake-defined system to one Machine.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::machine::SecretRef;
use super::Condition;

/// Reference to the target Machine in the same namespace.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineRef {
    pub name: String,
}

/// How the content of an additional file is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum AdditionalFileValue {
    /// Verbatim text from `inline`.
    Inline,
    /// Value of the first key (sorted order) of the referenced secret.
    SecretRef,
    /// Generated JSON facts document derived from the Machine status.
    NixosFacter,
}

/// One file injected into the checkout before hashing and applying.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalFile {
    /// Path relative to `configurationSubdir` inside the checkout.
    pub path: String,
    /// Content source.
    pub value_type: AdditionalFileValue,
    /// Inline content (for `valueType: Inline`).
    #[serde(default)]
    pub inline: Option<String>,
    /// Secret reference (for `valueType: SecretRef`).
    #[serde(default)]
    pub secret_ref: Option<SecretRef>,
}

/// NixosConfiguration Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: nio.homystack.com/v1alpha1
/// kind: NixosConfiguration
/// metadata:
///   name: cfg-a
///   namespace: default
/// spec:
///   machineRef:
///     name: mach-a
///   gitRepo: https://git.example/o/r.git
///   flake: "#host-a"
///   fullInstall: false
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "NixosConfiguration",
    group = "nio.homystack.com",
    version = "v1alpha1",
    namespaced,
    status = "NixosConfigurationStatus",
    printcolumn = r#"{"name":"Machine", "type":"string", "jsonPath":".spec.machineRef.name"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Commit", "type":"string", "jsonPath":".status.appliedCommit"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NixosConfigurationSpec {
    /// The Machine this configuration targets (same namespace).
    pub machine_ref: MachineRef,
    /// Git repository holding the flake.
    pub git_repo: String,
    /// Flake attribute suffix, e.g. `#host-a`.
    pub flake: String,
    /// Branch, tag or commit to track; defaults to `main`.
    #[serde(default = "default_git_ref", rename = "ref")]
    pub git_ref: String,
    /// Subdirectory of the checkout holding the flake.
    #[serde(default)]
    pub configuration_subdir: Option<String>,
    /// Flake attribute applied when the resource is deleted.
    #[serde(default)]
    pub on_remove_flake: Option<String>,
    /// Run `nixos-anywhere` for the initial bare-metal install.
    #[serde(default)]
    pub full_install: bool,
    /// Secret with `ssh-privatekey` or `token` for the git remote.
    #[serde(default)]
    pub credentials_ref: Option<SecretRef>,
    /// Extra files materialized into the checkout before applying.
    #[serde(default)]
    pub additional_files: Vec<AdditionalFile>,
}

pub fn default_git_ref() -> String {
    "main".to_string()
}

/// Status of a NixosConfiguration, owned by the configuration reconciler.
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NixosConfigurationStatus {
    /// Commit hash of the last successful apply.
    #[serde(default)]
    pub applied_commit: Option<String>,
    /// RFC3339 time of the last successful apply.
    #[serde(default)]
    pub last_applied_time: Option<String>,
    /// Name of the targeted Machine.
    #[serde(default)]
    pub target_machine: Option<String>,
    /// Post-injection directory hash of the applied checkout.
    #[serde(default)]
    pub configuration_hash: Option<String>,
    /// Hash of the `additionalFiles` specification.
    #[serde(default)]
    pub additional_files_hash: Option<String>,
    /// Monotone latch: true once `nixos-anywhere` completed, never reset.
    #[serde(default)]
    pub full_disk_install_completed: Option<bool>,
    /// Latest `Applied` condition.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl NixosConfigurationStatus {
    pub fn full_install_completed(&self) -> bool {
        self.full_disk_install_completed.unwrap_or(false)
    }
}

/// Builder for merge-patches against the NixosConfiguration status
/// subresource. Mirrors [`super::machine::MachineStatusPatch`].
#[derive(Debug, Default)]
pub struct ConfigurationStatusPatch(Map<String, Value>);

impl ConfigurationStatusPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_commit(mut self, value: Option<&str>) -> Self {
        self.0.insert("appliedCommit".into(), json!(value));
        self
    }

    pub fn last_applied_time(mut self, value: Option<&str>) -> Self {
        self.0.insert("lastAppliedTime".into(), json!(value));
        self
    }

    pub fn target_machine(mut self, value: &str) -> Self {
        self.0.insert("targetMachine".into(), json!(value));
        self
    }

    pub fn configuration_hash(mut self, value: &str) -> Self {
        self.0.insert("configurationHash".into(), json!(value));
        self
    }

    pub fn additional_files_hash(mut self, value: &str) -> Self {
        self.0.insert("additionalFilesHash".into(), json!(value));
        self
    }

    pub fn full_disk_install_completed(mut self, value: bool) -> Self {
        self.0.insert("fullDiskInstallCompleted".into(), json!(value));
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.0.insert("conditions".into(), json!([condition]));
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
    fn git_ref_defaults_to_main() {
        let spec: NixosConfigurationSpec = serde_json::from_value(json!({
            "machineRef": { "name": "mach-a" },
            "gitRepo": "https://git.example/o/r.git",
            "flake": "#host-a"
        }))
        .unwrap();
        assert_eq!(spec.git_ref, "main");
        assert!(!spec.full_install);
        assert!(spec.additional_files.is_empty());
    }

    #[test]
    fn ref_field_uses_short_name() {
        let spec: NixosConfigurationSpec = serde_json::from_value(json!({
            "machineRef": { "name": "mach-a" },
            "gitRepo": "https://git.example/o/r.git",
            "flake": "#host-a",
            "ref": "release-24.05"
        }))
        .unwrap();
        assert_eq!(spec.git_ref, "release-24.05");
    }

    #[test]
    fn additional_files_deserialize() {
        let spec: NixosConfigurationSpec = serde_json::from_value(json!({
            "machineRef": { "name": "mach-a" },
            "gitRepo": "https://git.example/o/r.git",
            "flake": "#host-a",
            "additionalFiles": [
                { "path": "secrets/token", "valueType": "SecretRef",
                  "secretRef": { "name": "tok" } },
                { "path": "facter.json", "valueType": "NixosFacter" },
                { "path": "motd", "valueType": "Inline", "inline": "hello" }
            ]
        }))
        .unwrap();
        assert_eq!(spec.additional_files.len(), 3);
        assert_eq!(
            spec.additional_files[0].value_type,
            AdditionalFileValue::SecretRef
        );
        assert_eq!(
            spec.additional_files[2].inline.as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn full_install_latch_defaults_false() {
        let status = NixosConfigurationStatus::default();
        assert!(!status.full_install_completed());
    }

    #[test]
    fn patch_builds_status_body() {
        let patch = ConfigurationStatusPatch::new()
            .applied_commit(Some("a".repeat(40).as_str()))
            .target_machine("mach-a")
            .full_disk_install_completed(true)
            .condition(Condition::applied(true, "Success", "ok"))
            .into_merge_patch();

        let status = patch.get("status").unwrap();
        assert_eq!(status["targetMachine"], "mach-a");
        assert_eq!(status["fullDiskInstallCompleted"], json!(true));
        assert_eq!(status["conditions"][0]["reason"], "Success");
    }
}
