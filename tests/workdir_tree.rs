//! Filesystem-level behavior of the checkout tree: deterministic layout,
//! hashing through file injection, sibling GC and the background sweep.

use std::time::Duration;

use nixos_infra_controller::workdir::{
    directory_hash, extract_repo_name, gc_peers, sweep_stale, workdir_path,
};
use tempfile::TempDir;

#[test]
fn layout_matches_persisted_state_contract() {
    let base = TempDir::new().unwrap();
    let commit = "0123456789abcdef0123456789abcdef01234567";
    let workdir = workdir_path(base.path(), "default", "cfg-a", "owner/repo", commit).unwrap();

    // <base>/<ns>/<cfg>/<owner>/<repo>@<commit>
    let relative = workdir.strip_prefix(base.path()).unwrap();
    assert_eq!(
        relative.to_string_lossy(),
        format!("default/cfg-a/owner/repo@{commit}")
    );
}

#[test]
fn repo_name_from_config_spec_url_nests_owner_level() {
    let repo_name = extract_repo_name("https://git.example/infra/hosts.git");
    assert_eq!(repo_name, "infra/hosts");

    let base = TempDir::new().unwrap();
    let workdir = workdir_path(base.path(), "ns", "cfg", &repo_name, "abc").unwrap();
    assert!(base.path().join("ns/cfg/infra").is_dir());
    assert!(workdir.ends_with("infra/hosts@abc"));
}

#[test]
fn injection_changes_the_directory_hash() {
    let base = TempDir::new().unwrap();
    let workdir = workdir_path(base.path(), "ns", "cfg", "o/r", "abc").unwrap();
    std::fs::write(workdir.join("flake.nix"), "{ outputs = _: { }; }").unwrap();

    let pre_injection = directory_hash(&workdir);

    // Simulate additional-file materialization.
    std::fs::create_dir_all(workdir.join("secrets")).unwrap();
    std::fs::write(workdir.join("secrets/token"), "s3cr3t").unwrap();

    let post_injection = directory_hash(&workdir);
    assert_ne!(pre_injection, post_injection);

    // Re-hashing without changes is stable.
    assert_eq!(post_injection, directory_hash(&workdir));
}

#[test]
fn commit_advance_gcs_the_previous_checkout() {
    let base = TempDir::new().unwrap();
    let old = workdir_path(base.path(), "ns", "cfg", "o/r", "oldcommit").unwrap();
    std::fs::write(old.join("flake.nix"), "old").unwrap();

    // A new commit lands: new workdir appears, siblings are garbage.
    let new = workdir_path(base.path(), "ns", "cfg", "o/r", "newcommit").unwrap();
    let removed = gc_peers(&new);

    assert_eq!(removed, 1);
    assert!(!old.exists());
    assert!(new.exists());
}

#[test]
fn background_sweep_spares_fresh_and_foreign_directories() {
    let base = TempDir::new().unwrap();
    let fresh = workdir_path(base.path(), "ns", "cfg", "o/r", "abc").unwrap();
    let foreign = base.path().join("ns/cfg/o/not-a-checkout");
    std::fs::create_dir_all(&foreign).unwrap();

    // 24h threshold: nothing qualifies.
    assert_eq!(sweep_stale(base.path(), Duration::from_secs(24 * 3600)), 0);
    assert!(fresh.exists());

    // Zero threshold: only the @-addressed checkout goes.
    assert_eq!(sweep_stale(base.path(), Duration::ZERO), 1);
    assert!(!fresh.exists());
    assert!(foreign.exists());
}
