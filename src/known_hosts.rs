//! # Known-Hosts Store
//!
//! Disk-backed `known_hosts` file shared by every SSH session the
//! controller opens. The policy is Trust On First Use: the first successful
//! connection to a host pins its key, all later connections verify against
//! the pinned entry. The store is process-wide; writes are serialized under
//! an internal mutex so concurrent reconciles cannot tear the file.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Persistent TOFU store for SSH host keys.
#[derive(Debug)]
pub struct KnownHostsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl KnownHostsStore {
    /// Open (or create) the store at `path` with owner-only permissions.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open known_hosts at {}", path.display()))?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)
                .with_context(|| format!("failed to chmod {}", path.display()))?;
        }

        info!(path = %path.display(), "using known_hosts file");
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Absolute path handed to `ssh -o UserKnownHostsFile=...`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` when no key is pinned yet for `host` (or
    /// `[host]:port` for non-default ports), meaning the caller should
    /// accept and record the key. Returns `false` when an entry exists and
    /// the session must verify strictly.
    pub fn trust_on_first_use(&self, host: &str, port: u16) -> bool {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => {
                info!(host, "TOFU: first connection, will trust host key");
                return true;
            }
        };

        let bracketed = format!("[{host}]:{port}");
        let known = content.lines().any(|line| {
            let line = line.trim_start();
            line.starts_with(&format!("{host} "))
                || line.starts_with(&format!("{host},"))
                || line.starts_with(&bracketed)
        });

        if known {
            debug!(host, "TOFU: found existing key");
            false
        } else {
            info!(host, "TOFU: first connection, will trust host key");
            true
        }
    }

    /// Append a host key entry. Duplicates (full-line compare) are
    /// suppressed, so repeated pins of the same key are no-ops.
    pub fn add_host_key(&self, host: &str, key_type: &str, base64_key: &str) -> Result<()> {
        let entry = format!("{host} {key_type} {base64_key}");

        let _guard = self.write_lock.lock().expect("known_hosts lock poisoned");

        if let Ok(content) = std::fs::read_to_string(&self.path) {
            if content.lines().any(|line| line == entry) {
                debug!(host, "host key already pinned");
                return Ok(());
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{entry}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;

        info!(host, key_type, "pinned host key");
        Ok(())
    }

    /// Remove every entry for `host`. Used when a machine is reinstalled
    /// and its host key legitimately changes.
    pub fn clear_host(&self, host: &str) -> Result<()> {
        let _guard = self.write_lock.lock().expect("known_hosts lock poisoned");

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Ok(()),
        };

        let plain_prefix = format!("{host} ");
        let bracket_prefix = format!("[{host}]:");
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| !line.starts_with(&plain_prefix) && !line.starts_with(&bracket_prefix))
            .collect();

        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        std::fs::write(&self.path, out)
            .with_context(|| format!("failed to rewrite {}", self.path.display()))?;

        info!(host, "removed pinned host keys");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, KnownHostsStore) {
        let dir = TempDir::new().unwrap();
        let store = KnownHostsStore::open(dir.path().join("known_hosts")).unwrap();
        (dir, store)
    }

    #[test]
    fn creates_file_with_owner_only_permissions() {
        let (_dir, store) = store();
        assert!(store.path().exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn first_use_then_strict() {
        let (_dir, store) = store();
        assert!(store.trust_on_first_use("10.0.0.5", 22));

        store
            .add_host_key("10.0.0.5", "ssh-ed25519", "AAAAC3NzaC1lZDI1NTE5AAAA")
            .unwrap();

        assert!(!store.trust_on_first_use("10.0.0.5", 22));
        // Different host is still unknown.
        assert!(store.trust_on_first_use("10.0.0.6", 22));
    }

    #[test]
    fn non_default_port_uses_bracket_form() {
        let (_dir, store) = store();
        store
            .add_host_key("[10.0.0.5]:2222", "ssh-ed25519", "AAAA")
            .unwrap();
        assert!(!store.trust_on_first_use("10.0.0.5", 2222));
    }

    #[test]
    fn duplicate_keys_are_suppressed() {
        let (_dir, store) = store();
        store.add_host_key("host-a", "ssh-ed25519", "AAAA").unwrap();
        store.add_host_key("host-a", "ssh-ed25519", "AAAA").unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn different_key_types_both_recorded() {
        let (_dir, store) = store();
        store.add_host_key("host-a", "ssh-ed25519", "AAAA").unwrap();
        store
            .add_host_key("host-a", "ecdsa-sha2-nistp256", "BBBB")
            .unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn clear_host_removes_all_entries() {
        let (_dir, store) = store();
        store.add_host_key("host-a", "ssh-ed25519", "AAAA").unwrap();
        store.add_host_key("[host-a]:2222", "ssh-ed25519", "BBBB").unwrap();
        store.add_host_key("host-b", "ssh-ed25519", "CCCC").unwrap();

        store.clear_host("host-a").unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("host-b"));
        assert!(store.trust_on_first_use("host-a", 22));
        assert!(store.trust_on_first_use("host-a", 2222));
    }

    #[test]
    fn clear_host_does_not_touch_prefix_collisions() {
        let (_dir, store) = store();
        store.add_host_key("host-a", "ssh-ed25519", "AAAA").unwrap();
        store.add_host_key("host-aa", "ssh-ed25519", "BBBB").unwrap();

        store.clear_host("host-a").unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("host-aa"));
        assert!(!content.contains("host-a ssh"));
    }
}
