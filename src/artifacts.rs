//! # Artifact Materializer
//!
//! Injects `additionalFiles` into a checkout before it is hashed and
//! applied: inline text, secret contents, or a generated facts document
//! describing the target machine. Injected files are registered with the
//! git index (`--intent-to-add`) so flake evaluation includes them without
//! creating a commit.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::context::ControllerContext;
use crate::crd::{AdditionalFileValue, Machine, NixosConfigurationSpec};
use crate::error::Result;
use crate::git;
use crate::validation::{validate_path, DEFAULT_MAX_PATH_LENGTH};
use crate::workdir::directory_hash;

/// Synthesize the facts document for `NixosFacter` files: machine identity
/// merged with the hardware facts from the latest scan.
pub fn generate_nixos_facts(machine: &Machine) -> Value {
    let spec = &machine.spec;
    let mut facts = serde_json::Map::new();
    facts.insert("machine-id".into(), json!(spec.hostname));
    facts.insert("hostname".into(), json!(spec.hostname));
    facts.insert(
        "ip-address".into(),
        json!(spec.ip_address.as_deref().unwrap_or("unknown")),
    );

    if let Some(hardware) = machine
        .status
        .as_ref()
        .and_then(|s| s.hardware_facts.as_ref())
    {
        for (key, value) in hardware {
            facts.insert(key.clone(), value.clone());
        }
    }

    Value::Object(facts)
}

/// Materialize every `additionalFiles` entry into
/// `<repo>/<configurationSubdir>/<path>` and return the post-injection
/// directory hash used as `configurationHash`.
///
/// Individual entry failures (missing secret, unwritable path) are logged
/// and skipped; the remaining files still land. The git index registration
/// is best-effort.
pub async fn inject_additional_files(
    ctx: &ControllerContext,
    repo_path: &Path,
    spec: &NixosConfigurationSpec,
    namespace: &str,
    machine: &Machine,
) -> Result<String> {
    let base_path = match spec.configuration_subdir.as_deref() {
        Some(subdir) if !subdir.is_empty() => repo_path.join(subdir),
        _ => repo_path.to_path_buf(),
    };

    if spec.additional_files.is_empty() {
        return Ok(directory_hash(repo_path));
    }

    let mut injected: Vec<PathBuf> = Vec::new();

    for file in &spec.additional_files {
        validate_path(&file.path, DEFAULT_MAX_PATH_LENGTH)?;
        let file_path = base_path.join(&file.path);
        if let Some(parent) = file_path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                error!(path = %file_path.display(), error = %err, "failed to create parent directory");
                continue;
            }
        }

        match file.value_type {
            AdditionalFileValue::Inline => {
                let content = file.inline.as_deref().unwrap_or_default();
                match std::fs::write(&file_path, content) {
                    Ok(()) => {
                        info!(path = %file.path, "injected inline file");
                        injected.push(file_path);
                    }
                    Err(err) => {
                        error!(path = %file.path, error = %err, "failed to inject inline file");
                    }
                }
            }
            AdditionalFileValue::SecretRef => {
                let Some(secret_ref) = &file.secret_ref else {
                    warn!(path = %file.path, "missing secret reference for file");
                    continue;
                };
                let secret_namespace = secret_ref.namespace.as_deref().unwrap_or(namespace);
                match ctx.read_secret(&secret_ref.name, secret_namespace).await {
                    Ok(data) => {
                        // First key in sorted order: deterministic for any
                        // single-key secret, stable for multi-key ones.
                        let Some((key, content)) = data.iter().next() else {
                            warn!(path = %file.path, secret = %secret_ref.name, "empty secret");
                            continue;
                        };
                        match std::fs::write(&file_path, content) {
                            Ok(()) => {
                                info!(
                                    path = %file.path,
                                    secret = %secret_ref.name,
                                    key = %key,
                                    "injected secret file"
                                );
                                injected.push(file_path);
                            }
                            Err(err) => {
                                error!(path = %file.path, error = %err, "failed to inject secret file");
                            }
                        }
                    }
                    Err(err) => {
                        error!(
                            path = %file.path,
                            secret = %secret_ref.name,
                            error = %err,
                            "failed to read secret for file"
                        );
                    }
                }
            }
            AdditionalFileValue::NixosFacter => {
                let facts = generate_nixos_facts(machine);
                let content = serde_json::to_string_pretty(&facts)
                    .unwrap_or_else(|_| "{}".to_string());
                match std::fs::write(&file_path, content) {
                    Ok(()) => {
                        info!(path = %file.path, "generated nixos facter file");
                        injected.push(file_path);
                    }
                    Err(err) => {
                        error!(path = %file.path, error = %err, "failed to write facter file");
                    }
                }
            }
        }
    }

    if !injected.is_empty() {
        let relative: Vec<PathBuf> = injected
            .iter()
            .filter_map(|p| p.strip_prefix(repo_path).ok().map(Path::to_path_buf))
            .collect();
        git::add_intent_to_add(repo_path, &relative).await;
        info!(count = injected.len(), "registered injected files with git index");
    }

    Ok(directory_hash(&base_path))
}
