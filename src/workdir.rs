//! # Hash & Workdir Layer
//!
//! Deterministic per-configuration checkout paths, content hashing, flake
//! reference parsing and workdir garbage collection.
//!
//! A checkout lives at `<base>/<namespace>/<name>/<repoName>@<commitHash>`
//! (`repoName` is `owner/repo` and nests one level). Because the directory
//! is addressed by commit hash, a reconcile can reuse an existing checkout
//! and delete every sibling once a new commit lands.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::crd::{AdditionalFile, AdditionalFileValue};

static COMMIT_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{40}$").expect("commit hash regex is valid"));

/// Whether `s` is a full lowercase hex commit hash.
pub fn is_commit_hash(s: &str) -> bool {
    COMMIT_HASH.is_match(s)
}

/// Parsed flake source reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakeReference {
    /// `owner/repo` for GitHub sources, `local` or `unknown` otherwise.
    pub repo_name: String,
    /// Cloneable URL for the source (`.` for local flakes).
    pub repo_url: String,
    /// Pin state of the reference.
    pub commit: FlakeCommit,
}

/// Whether a flake reference pins a concrete commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlakeCommit {
    /// A literal 40-char lowercase hex commit.
    Pinned(String),
    /// A branch or tag whose commit must be resolved remotely.
    Floating,
    /// A `.#attr` local flake.
    Local,
    /// Any source scheme this controller does not understand.
    Unknown,
}

impl FlakeCommit {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pinned(hash) => hash,
            Self::Floating => "floating",
            Self::Local => "local",
            Self::Unknown => "unknown",
        }
    }
}

/// Parse a flake reference into its source parts.
///
/// Supported forms:
/// - `github:owner/repo#host`
/// - `github:owner/repo/v1.0#host` (floating ref)
/// - `github:owner/repo/<40-hex>#host` (pinned commit)
/// - `.#host` (local)
pub fn parse_flake_reference(flake_ref: &str) -> FlakeReference {
    if flake_ref.starts_with('.') {
        return FlakeReference {
            repo_name: "local".to_string(),
            repo_url: ".".to_string(),
            commit: FlakeCommit::Local,
        };
    }

    let source = flake_ref.split_once('#').map_or(flake_ref, |(s, _)| s);

    if let Some(rest) = source.strip_prefix("github:") {
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() >= 2 {
            let owner = parts[0];
            let repo = parts[1];
            let commit = match parts.get(2) {
                Some(reference) if COMMIT_HASH.is_match(reference) => {
                    FlakeCommit::Pinned((*reference).to_string())
                }
                _ => FlakeCommit::Floating,
            };
            return FlakeReference {
                repo_name: format!("{owner}/{repo}"),
                repo_url: format!("https://github.com/{owner}/{repo}.git"),
                commit,
            };
        }
    }

    FlakeReference {
        repo_name: "unknown".to_string(),
        repo_url: source.to_string(),
        commit: FlakeCommit::Unknown,
    }
}

/// Extract `owner/repo` from a Git URL by stripping the protocol and the
/// `.git` suffix and keeping the final two path components.
pub fn extract_repo_name(git_url: &str) -> String {
    let clean = git_url
        .split_once("://")
        .map_or(git_url, |(_, rest)| rest)
        .trim_end_matches('/');
    let clean = clean.strip_suffix(".git").unwrap_or(clean);

    let parts: Vec<&str> = clean.split('/').collect();
    if parts.len() >= 2 {
        format!("{}/{}", parts[parts.len() - 2], parts[parts.len() - 1])
    } else {
        clean.to_string()
    }
}

/// Deterministic workdir for one `(namespace, name, repo, commit)` tuple.
/// The directory is created if absent.
pub fn workdir_path(
    base: &Path,
    namespace: &str,
    name: &str,
    repo_name: &str,
    commit_hash: &str,
) -> Result<PathBuf> {
    let workdir = base
        .join(namespace)
        .join(name)
        .join(format!("{repo_name}@{commit_hash}"));
    std::fs::create_dir_all(&workdir)
        .with_context(|| format!("failed to create workdir {}", workdir.display()))?;
    Ok(workdir)
}

/// SHA-256 over a deterministic walk of `path`.
///
/// Entries are visited in sorted order; for each file the path relative to
/// the root is absorbed, then the contents in 8 KiB blocks. Unreadable
/// files are skipped with a log line. A missing root yields the empty
/// string; callers treat that as "no hash yet".
pub fn directory_hash(path: &Path) -> String {
    if !path.exists() {
        return String::new();
    }

    let mut hasher = Sha256::new();
    let walker = WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file());

    for entry in walker {
        let rel = entry
            .path()
            .strip_prefix(path)
            .unwrap_or_else(|_| entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());

        let mut file = match File::open(entry.path()) {
            Ok(file) => file,
            Err(err) => {
                debug!(path = %entry.path().display(), error = %err, "skipping unreadable file");
                continue;
            }
        };
        let mut buf = [0u8; 8192];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => hasher.update(&buf[..n]),
                Err(err) => {
                    debug!(path = %entry.path().display(), error = %err, "read failed mid-file");
                    break;
                }
            }
        }
    }

    format!("{:x}", hasher.finalize())
}

/// Serialize a JSON value with object keys sorted at every level.
/// Deterministic regardless of map iteration order.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

/// SHA-256 over the canonical serialization of the `additionalFiles`
/// specification. `nixos_facts` is the materialized facter snapshot for the
/// target machine, absorbed so a facts change re-triggers reconciliation.
/// An empty spec yields the empty string.
pub fn additional_files_hash(
    files: &[AdditionalFile],
    nixos_facts: Option<&serde_json::Value>,
) -> String {
    if files.is_empty() {
        return String::new();
    }

    let entries: Vec<serde_json::Value> = files
        .iter()
        .map(|file| {
            let mut entry = serde_json::Map::new();
            entry.insert("path".into(), serde_json::json!(file.path));
            entry.insert("valueType".into(), serde_json::json!(file.value_type));
            match file.value_type {
                AdditionalFileValue::Inline => {
                    entry.insert(
                        "inline".into(),
                        serde_json::json!(file.inline.as_deref().unwrap_or_default()),
                    );
                }
                AdditionalFileValue::SecretRef => {
                    entry.insert("secretRef".into(), serde_json::json!(file.secret_ref));
                }
                AdditionalFileValue::NixosFacter => {
                    if let Some(facts) = nixos_facts {
                        entry.insert("nixosFacter".into(), facts.clone());
                    }
                }
            }
            serde_json::Value::Object(entry)
        })
        .collect();

    let canonical = canonical_json(&serde_json::Value::Array(entries));
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Delete every sibling directory of `current` under the same parent.
/// Safe because the live checkout is addressed by commit hash.
pub fn gc_peers(current: &Path) -> usize {
    let Some(parent) = current.parent() else {
        return 0;
    };
    let Ok(entries) = std::fs::read_dir(parent) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path == current || !path.is_dir() {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(path = %path.display(), "garbage collected old checkout");
                removed += 1;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to garbage collect");
            }
        }
    }
    removed
}

/// Remove every `<repo>@<commit>` directory under `base` whose mtime is
/// older than `max_age`. Returns the number of directories removed.
pub fn sweep_stale(base: &Path, max_age: Duration) -> usize {
    if !base.exists() {
        return 0;
    }

    let now = SystemTime::now();
    let mut removed = 0;

    let mut it = WalkDir::new(base).min_depth(1).into_iter();
    while let Some(entry) = it.next() {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let is_checkout = entry.file_type().is_dir()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains('@'));
        if !is_checkout {
            continue;
        }

        // Checkouts never nest; skip this subtree either way.
        it.skip_current_dir();

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|mtime| now.duration_since(mtime).ok());
        let Some(age) = age else { continue };

        if age > max_age {
            match std::fs::remove_dir_all(path) {
                Ok(()) => {
                    info!(
                        path = %path.display(),
                        age_hours = age.as_secs_f64() / 3600.0,
                        "GC: removed stale checkout"
                    );
                    removed += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "GC: failed to remove");
                }
            }
        }
    }
    removed
}
