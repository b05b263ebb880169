//! # Configuration Reconciler
//!
//! The configuration reconcile state machine. A single entry point handles
//! create, update, resume, the periodic tick and deletion (via finalizer):
//!
//! 1. availability gate on the referenced Machine
//! 2. resolve the source to a concrete commit
//! 3. change detection against `(appliedCommit, additionalFilesHash)`
//! 4. deterministic workdir + clone
//! 5. additional-files injection and hashing
//! 6. `nixos-anywhere` (first full install only) or `nixos-rebuild switch`
//! 7. status commit on both resources, then sibling checkout GC
//!
//! A no-op reconcile spawns no apply command and writes no status. The
//! full-install latch is monotone: once `fullDiskInstallCompleted` is true,
//! `nixos-anywhere` is never composed again.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{finalizer, Event as Finalizer};
use tracing::{debug, error, info, warn};

use crate::artifacts::{generate_nixos_facts, inject_additional_files};
use crate::context::ControllerContext;
use crate::controller::machine::probe_discoverable;
use crate::crd::{
    Condition, ConfigurationStatusPatch, Machine, MachineStatusPatch, NixosConfiguration,
    NixosConfigurationSpec, NixosConfigurationStatus,
};
use crate::error::Error;
use crate::events::reason;
use crate::git;
use crate::observability::metrics;
use crate::retry::retry_with_backoff;
use crate::runner::CommandSpec;
use crate::ssh::establish_session;
use crate::validation::{validate_git_url, validate_path, DEFAULT_MAX_PATH_LENGTH};
use crate::workdir::{
    self, extract_repo_name, gc_peers, is_commit_hash, parse_flake_reference, workdir_path,
    FlakeCommit,
};

/// Finalizer guaranteeing `onRemoveFlake` runs before the resource is
/// released.
pub const FINALIZER: &str = "nixosconfigurations.nio.homystack.com/cleanup";

/// Where the repository and flake attribute for a configuration come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub repo_url: String,
    pub repo_name: String,
    /// Set when the reference pins a literal commit; skips remote
    /// resolution entirely.
    pub pinned_commit: Option<String>,
    /// `#attr` suffix appended to the checkout path.
    pub flake_attr: String,
}

/// Resolve the configuration's source.
///
/// `spec.flake` is normally a bare `#attr` suffix applied to `spec.gitRepo`.
/// A full `github:owner/repo[/ref]#attr` reference is also accepted and
/// overrides the repository; a pinned 40-hex ref (in either form) skips
/// remote ref resolution.
pub fn resolve_source(spec: &NixosConfigurationSpec) -> SourceInfo {
    if !spec.flake.starts_with('#') && !spec.flake.starts_with('.') {
        let parsed = parse_flake_reference(&spec.flake);
        if matches!(parsed.commit, FlakeCommit::Pinned(_) | FlakeCommit::Floating) {
            let flake_attr = spec
                .flake
                .split_once('#')
                .map(|(_, attr)| format!("#{attr}"))
                .unwrap_or_default();
            let pinned_commit = match parsed.commit {
                FlakeCommit::Pinned(hash) => Some(hash),
                _ => None,
            };
            return SourceInfo {
                repo_url: parsed.repo_url,
                repo_name: parsed.repo_name,
                pinned_commit,
                flake_attr,
            };
        }
    }

    SourceInfo {
        repo_url: spec.git_repo.clone(),
        repo_name: extract_repo_name(&spec.git_repo),
        pinned_commit: is_commit_hash(&spec.git_ref).then(|| spec.git_ref.clone()),
        flake_attr: spec.flake.clone(),
    }
}

/// Change-detection verdict for one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeDecision {
    pub should_apply: bool,
    pub commit_changed: bool,
    pub files_changed: bool,
}

/// The product `(appliedCommit, additionalFilesHash)` fully determines
/// whether a reconcile is a no-op.
pub fn detect_changes(
    status: Option<&NixosConfigurationStatus>,
    commit: &str,
    additional_files_hash: &str,
) -> ChangeDecision {
    let applied_commit = status.and_then(|s| s.applied_commit.as_deref());
    let applied_files_hash = status
        .and_then(|s| s.additional_files_hash.as_deref())
        .unwrap_or("");

    let commit_changed = applied_commit != Some(commit);
    let files_changed = applied_files_hash != additional_files_hash;

    ChangeDecision {
        should_apply: commit_changed || files_changed,
        commit_changed,
        files_changed,
    }
}

/// Whether this pass must run `nixos-anywhere` instead of `nixos-rebuild`.
/// Monotone by construction: the latch in the status never resets.
pub fn needs_full_install(
    spec: &NixosConfigurationSpec,
    status: Option<&NixosConfigurationStatus>,
) -> bool {
    spec.full_install && !status.is_some_and(NixosConfigurationStatus::full_install_completed)
}

/// A composed apply invocation plus its metrics label.
#[derive(Debug)]
pub struct ApplyPlan {
    pub command: CommandSpec,
    pub build_type: &'static str,
}

/// Compose the apply command for one reconcile.
///
/// Full installs run `nixos-anywhere` with the identity file as an
/// argument; updates run `nixos-rebuild switch` through `nix shell` with
/// the identity file carried in `NIX_SSHOPTS`.
pub fn compose_apply_command(
    ssh_user: &str,
    target_host: &str,
    config_path: &Path,
    flake_attr: &str,
    identity: Option<&Path>,
    full_install: bool,
) -> ApplyPlan {
    let flake_arg = format!("{}{}", config_path.display(), flake_attr);
    let target = format!("{ssh_user}@{target_host}");
    let base = CommandSpec::new("nix").args(["--extra-experimental-features", "nix-command flakes"]);

    if full_install {
        let mut command = base.args([
            "run",
            "github:nix-community/nixos-anywhere",
            "--",
            "--target-host",
            &target,
            "--flake",
            &flake_arg,
        ]);
        if let Some(identity) = identity {
            command = command
                .arg("-i")
                .arg(identity.to_string_lossy().into_owned());
        }
        ApplyPlan {
            command,
            build_type: "nixos-anywhere",
        }
    } else {
        let mut command = base.args([
            "shell",
            "nixpkgs#nixos-rebuild",
            "--command",
            "nixos-rebuild",
            "switch",
            "--flake",
            &flake_arg,
            "--target-host",
            &target,
        ]);
        if let Some(identity) = identity {
            command = command.env_var("NIX_SSHOPTS", format!("-i {}", identity.display()));
        }
        ApplyPlan {
            command,
            build_type: "nixos-rebuild",
        }
    }
}

/// Entry point wired into the controller runtime. Routes through the
/// finalizer so deletion always observes `onRemoveFlake`.
pub async fn reconcile(
    config: Arc<NixosConfiguration>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, Error> {
    metrics::increment_configuration_reconciliations();

    let namespace = config.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<NixosConfiguration> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, config, |event| async {
        match event {
            Finalizer::Apply(config) => apply(&config, &ctx, &namespace).await,
            Finalizer::Cleanup(config) => cleanup(&config, &ctx, &namespace).await,
        }
    })
    .await
    .map_err(|err| Error::TransientIo(anyhow::anyhow!("finalizer handling failed: {err}")))
}

/// Requeue policy for reconcile errors (temporary failures re-run after a
/// minute; the condition was already updated inside the reconcile).
pub fn error_policy(
    config: Arc<NixosConfiguration>,
    error: &Error,
    _ctx: Arc<ControllerContext>,
) -> Action {
    error!(
        configuration = %config.name_any(),
        error = %error,
        "configuration reconciliation error"
    );
    metrics::increment_reconciliation_errors(error.kind());
    Action::requeue(Duration::from_secs(60))
}

/// Update the failure condition and translate the error for the scheduler.
async fn fail(
    ctx: &ControllerContext,
    config: &NixosConfiguration,
    namespace: &str,
    machine_name: &str,
    err: Error,
) -> Error {
    metrics::increment_configurations_failed(err.kind());

    let condition_reason = match &err {
        Error::Validation { .. } => "ValidationError",
        Error::Credential(_) => "MissingCredentials",
        other => other.kind(),
    };
    let message = err.to_string();
    let patch = ConfigurationStatusPatch::new()
        .target_machine(machine_name)
        .condition(Condition::applied(false, condition_reason, &message));

    if let Err(patch_err) = ctx
        .patch_configuration_status(namespace, &config.name_any(), patch)
        .await
    {
        warn!(error = %patch_err, "failed to update failure condition");
    }

    if matches!(err, Error::ExternalCommand { .. } | Error::Timeout { .. }) {
        ctx.events
            .warn(&config.object_ref(&()), reason::BUILD_FAILED, &message)
            .await;
    }

    err
}

/// Validate every spec value that later reaches a command line.
fn validate_spec(spec: &NixosConfigurationSpec) -> Result<(), Error> {
    validate_git_url(&spec.git_repo)?;
    validate_path(&spec.flake, DEFAULT_MAX_PATH_LENGTH)?;
    if let Some(remove_flake) = spec.on_remove_flake.as_deref() {
        validate_path(remove_flake, DEFAULT_MAX_PATH_LENGTH)?;
    }
    if let Some(subdir) = spec.configuration_subdir.as_deref() {
        validate_path(subdir, DEFAULT_MAX_PATH_LENGTH)?;
    }
    Ok(())
}

/// Gate + fetch: the referenced Machine, only if it is discoverable.
async fn available_machine(
    ctx: &ControllerContext,
    config: &NixosConfiguration,
    namespace: &str,
) -> Result<Option<Machine>, Error> {
    let machine_name = &config.spec.machine_ref.name;
    let name = config.name_any();

    let machine = match ctx.get_machine(namespace, machine_name).await {
        Ok(machine) => machine,
        Err(err @ Error::Credential(_)) => {
            warn!(machine = %machine_name, configuration = %name, "referenced machine not found");
            let patch = ConfigurationStatusPatch::new()
                .target_machine(machine_name)
                .condition(Condition::applied(
                    false,
                    "MissingCredentials",
                    &err.to_string(),
                ));
            ctx.patch_configuration_status(namespace, &name, patch).await?;
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    let owner = config.object_ref(&());
    if !probe_discoverable(ctx, &machine, namespace, &owner).await {
        warn!(
            machine = %machine_name,
            configuration = %name,
            "machine is not discoverable"
        );
        ctx.events
            .warn(
                &owner,
                reason::MACHINE_NOT_DISCOVERABLE,
                &format!("Machine {machine_name} is not reachable over SSH"),
            )
            .await;
        let patch = ConfigurationStatusPatch::new()
            .target_machine(machine_name)
            .condition(Condition::applied(
                false,
                "MissingCredentials",
                "Configuration application skipped due to missing SSH credentials",
            ));
        ctx.patch_configuration_status(namespace, &name, patch).await?;
        return Ok(None);
    }

    Ok(Some(machine))
}

/// Resolve the source to a concrete commit, using the remote only for
/// floating refs.
async fn resolve_commit(
    ctx: &ControllerContext,
    spec: &NixosConfigurationSpec,
    source: &SourceInfo,
    namespace: &str,
) -> Result<String, Error> {
    if let Some(pinned) = &source.pinned_commit {
        debug!(commit = %pinned, "flake reference pins a commit, skipping remote resolution");
        return Ok(pinned.clone());
    }

    let result = retry_with_backoff("remote ref resolution", &ctx.config.retry, || {
        git::remote_commit_hash(
            ctx,
            &source.repo_url,
            &spec.git_ref,
            spec.credentials_ref.as_ref(),
            namespace,
        )
    })
    .await;
    metrics::record_git_operation("ls-remote", result.is_ok());
    result
}

/// Normal reconcile pass (create/update/resume/tick).
async fn apply(
    config: &NixosConfiguration,
    ctx: &ControllerContext,
    namespace: &str,
) -> Result<Action, Error> {
    let start = Instant::now();
    let name = config.name_any();
    let spec = &config.spec;
    let machine_name = spec.machine_ref.name.clone();
    let requeue = Action::requeue(ctx.config.config_reconcile_interval);

    info!(configuration = %format!("{namespace}/{name}"), "reconciling configuration");

    // Step 0: reject hostile input before anything else. Permanent: the
    // condition is recorded and the resource is left alone until its spec
    // changes.
    if let Err(err) = validate_spec(spec) {
        let err = fail(ctx, config, namespace, &machine_name, err).await;
        warn!(configuration = %name, error = %err, "spec validation failed");
        return Ok(Action::await_change());
    }

    // Step 1: availability gate.
    let Some(machine) = available_machine(ctx, config, namespace).await? else {
        return Ok(requeue);
    };

    // Step 2: resolve source to a concrete commit.
    let source = resolve_source(spec);
    let commit = match resolve_commit(ctx, spec, &source, namespace).await {
        Ok(commit) => commit,
        Err(err) => return Err(fail(ctx, config, namespace, &machine_name, err).await),
    };

    // Step 3: spec-level hash of the additional files.
    let facts = generate_nixos_facts(&machine);
    let additional_files_hash =
        workdir::additional_files_hash(&spec.additional_files, Some(&facts));

    // Step 4: change detection. A no-op pass ends here: no clone, no
    // subprocess, no status write.
    let decision = detect_changes(config.status.as_ref(), &commit, &additional_files_hash);
    if !decision.should_apply {
        debug!(configuration = %name, commit = %commit, "no changes detected, skipping");
        return Ok(requeue);
    }
    info!(
        configuration = %name,
        commit_changed = decision.commit_changed,
        files_changed = decision.files_changed,
        "changes detected"
    );

    // Step 5: deterministic workdir and (retried) clone into it.
    let workdir = workdir_path(
        &ctx.config.base_config_path,
        namespace,
        &name,
        &source.repo_name,
        &commit,
    )
    .map_err(Error::TransientIo)?;

    let clone_result = retry_with_backoff("git clone", &ctx.config.retry, || {
        git::clone(
            ctx,
            &source.repo_url,
            spec.credentials_ref.as_ref(),
            namespace,
            Some(&workdir),
        )
    })
    .await;
    metrics::record_git_operation("clone", clone_result.is_ok());
    let (repo_path, actual_commit) = match clone_result {
        Ok(result) => result,
        Err(err) => return Err(fail(ctx, config, namespace, &machine_name, err).await),
    };
    if actual_commit != commit {
        warn!(
            expected = %commit,
            actual = %actual_commit,
            "checkout commit differs from resolved ref"
        );
    }

    // Step 6: injection + post-injection hash.
    let configuration_hash =
        match inject_additional_files(ctx, &repo_path, spec, namespace, &machine).await {
            Ok(hash) => hash,
            Err(err) => return Err(fail(ctx, config, namespace, &machine_name, err).await),
        };

    // Step 7: decide install mode and apply.
    let full_install = needs_full_install(spec, config.status.as_ref());
    let previously_completed = config
        .status
        .as_ref()
        .is_some_and(NixosConfigurationStatus::full_install_completed);

    let owner = config.object_ref(&());
    let session = match establish_session(ctx, &machine.spec, namespace, &owner).await {
        Ok(session) => session,
        Err(err) => return Err(fail(ctx, config, namespace, &machine_name, err).await),
    };

    let config_path = match spec.configuration_subdir.as_deref() {
        Some(subdir) if !subdir.is_empty() => repo_path.join(subdir),
        _ => repo_path.clone(),
    };
    let plan = compose_apply_command(
        &machine.spec.ssh_user,
        machine.spec.target_host(),
        &config_path,
        &source.flake_attr,
        session.identity_path(),
        full_install,
    );

    let apply_started = Instant::now();
    let outcome = match ctx
        .runner
        .run(&plan.command, ctx.config.nixos_apply_timeout)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            metrics::record_nixos_build(plan.build_type, false, 0.0);
            return Err(fail(ctx, config, namespace, &machine_name, err).await);
        }
    };
    metrics::record_nixos_build(
        plan.build_type,
        outcome.success,
        apply_started.elapsed().as_secs_f64(),
    );

    if !outcome.success {
        let err = Error::ExternalCommand {
            command: plan.command.display_line(),
            exit_code: outcome.exit_code,
            stderr_tail: outcome.stderr_summary(),
        };
        return Err(fail(ctx, config, namespace, &machine_name, err).await);
    }

    // Step 8: commit status on both resources.
    let now = Utc::now().to_rfc3339();
    let config_patch = ConfigurationStatusPatch::new()
        .applied_commit(Some(&actual_commit))
        .last_applied_time(Some(&now))
        .target_machine(&machine_name)
        .configuration_hash(&configuration_hash)
        .additional_files_hash(&additional_files_hash)
        .full_disk_install_completed(previously_completed || full_install)
        .condition(Condition::applied(
            true,
            "Success",
            "Configuration successfully applied",
        ));
    ctx.patch_configuration_status(namespace, &name, config_patch)
        .await?;

    let machine_patch = MachineStatusPatch::new()
        .has_configuration(true)
        .applied_configuration(Some(&name))
        .applied_commit(Some(&actual_commit))
        .last_applied_time(&now);
    ctx.patch_machine_status(namespace, &machine_name, machine_patch)
        .await?;

    ctx.events
        .normal(
            &owner,
            reason::CONFIGURATION_APPLIED,
            &format!("Applied commit {actual_commit} to machine {machine_name}"),
        )
        .await;
    metrics::increment_configurations_applied();

    // Step 9: GC sibling checkouts of older commits.
    let collected = gc_peers(&workdir);
    if collected > 0 {
        metrics::increment_workdirs_collected(collected as u64);
    }

    metrics::observe_reconcile_duration(start.elapsed().as_secs_f64());
    info!(
        configuration = %name,
        commit = %actual_commit,
        build_type = plan.build_type,
        "configuration applied"
    );
    Ok(requeue)
}

/// Deletion pass, invoked under the finalizer. Returning `Ok` releases the
/// resource; an error keeps the finalizer and retries.
async fn cleanup(
    config: &NixosConfiguration,
    ctx: &ControllerContext,
    namespace: &str,
) -> Result<Action, Error> {
    let name = config.name_any();
    let spec = &config.spec;
    let machine_name = spec.machine_ref.name.clone();

    info!(configuration = %format!("{namespace}/{name}"), "handling deletion");

    let clear_machine = |reason: &'static str| {
        let machine_name = machine_name.clone();
        async move {
            debug!(machine = %machine_name, reason, "clearing machine configuration status");
            let patch = MachineStatusPatch::new()
                .has_configuration(false)
                .applied_configuration(None)
                .applied_commit(None);
            if let Err(err) = ctx
                .patch_machine_status(namespace, &machine_name, patch)
                .await
            {
                warn!(machine = %machine_name, error = %err, "failed to clear machine status");
            }
        }
    };

    let Some(remove_flake) = spec.on_remove_flake.clone() else {
        info!(configuration = %name, "deletion without onRemoveFlake, releasing");
        clear_machine("no onRemoveFlake").await;
        return Ok(Action::await_change());
    };

    if let Err(err) = validate_spec(spec) {
        // A spec hostile enough to fail validation is not worth blocking
        // deletion for.
        warn!(configuration = %name, error = %err, "invalid spec on deletion, releasing");
        clear_machine("invalid spec").await;
        return Ok(Action::await_change());
    }

    let Some(machine) = available_machine(ctx, config, namespace).await? else {
        // The target is gone or unreachable; nothing to unprovision.
        info!(configuration = %name, "machine unavailable on deletion, releasing");
        clear_machine("machine unavailable").await;
        return Ok(Action::await_change());
    };

    let source = resolve_source(spec);
    let commit = resolve_commit(ctx, spec, &source, namespace).await?;

    let workdir = workdir_path(
        &ctx.config.base_config_path,
        namespace,
        &name,
        &source.repo_name,
        &commit,
    )
    .map_err(Error::TransientIo)?;

    let (repo_path, actual_commit) = retry_with_backoff("git clone", &ctx.config.retry, || {
        git::clone(
            ctx,
            &source.repo_url,
            spec.credentials_ref.as_ref(),
            namespace,
            Some(&workdir),
        )
    })
    .await?;

    let owner = config.object_ref(&());
    let session = establish_session(ctx, &machine.spec, namespace, &owner).await?;

    let config_path = match spec.configuration_subdir.as_deref() {
        Some(subdir) if !subdir.is_empty() => repo_path.join(subdir),
        _ => repo_path.clone(),
    };
    // The remove flake always runs as an in-place switch; a destructive
    // reinstall on deletion would be nonsense.
    let plan = compose_apply_command(
        &machine.spec.ssh_user,
        machine.spec.target_host(),
        &config_path,
        &remove_flake,
        session.identity_path(),
        false,
    );

    let outcome = ctx
        .runner
        .run(&plan.command, ctx.config.nixos_apply_timeout)
        .await?;
    if !outcome.success {
        let err = Error::ExternalCommand {
            command: plan.command.display_line(),
            exit_code: outcome.exit_code,
            stderr_tail: outcome.stderr_summary(),
        };
        return Err(fail(ctx, config, namespace, &machine_name, err).await);
    }

    let now = Utc::now().to_rfc3339();
    clear_machine("removed").await;

    let previously_completed = config
        .status
        .as_ref()
        .is_some_and(NixosConfigurationStatus::full_install_completed);
    let config_patch = ConfigurationStatusPatch::new()
        .applied_commit(Some(&actual_commit))
        .last_applied_time(Some(&now))
        .target_machine(&machine_name)
        .full_disk_install_completed(previously_completed)
        .condition(Condition::applied(
            true,
            "Removed",
            "Configuration successfully removed",
        ));
    // The resource is going away; a failed status write must not block the
    // release.
    if let Err(err) = ctx
        .patch_configuration_status(namespace, &name, config_patch)
        .await
    {
        debug!(configuration = %name, error = %err, "status patch on deletion failed");
    }

    info!(configuration = %name, "remove flake applied, releasing");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::MachineRef;

    fn spec(flake: &str) -> NixosConfigurationSpec {
        NixosConfigurationSpec {
            machine_ref: MachineRef {
                name: "mach-a".into(),
            },
            git_repo: "https://git.example/o/r.git".into(),
            flake: flake.into(),
            git_ref: "main".into(),
            configuration_subdir: None,
            on_remove_flake: None,
            full_install: false,
            credentials_ref: None,
            additional_files: Vec::new(),
        }
    }

    fn status(
        commit: Option<&str>,
        files_hash: Option<&str>,
        full_install_completed: bool,
    ) -> NixosConfigurationStatus {
        NixosConfigurationStatus {
            applied_commit: commit.map(str::to_string),
            additional_files_hash: files_hash.map(str::to_string),
            full_disk_install_completed: Some(full_install_completed),
            ..NixosConfigurationStatus::default()
        }
    }

    const COMMIT_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const COMMIT_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn matching_state_is_a_noop() {
        let status = status(Some(COMMIT_A), Some("fh"), false);
        let decision = detect_changes(Some(&status), COMMIT_A, "fh");
        assert!(!decision.should_apply);
        assert!(!decision.commit_changed);
        assert!(!decision.files_changed);
    }

    #[test]
    fn commit_advance_triggers_apply() {
        let status = status(Some(COMMIT_A), Some("fh"), false);
        let decision = detect_changes(Some(&status), COMMIT_B, "fh");
        assert!(decision.should_apply);
        assert!(decision.commit_changed);
        assert!(!decision.files_changed);
    }

    #[test]
    fn files_change_triggers_apply() {
        let status = status(Some(COMMIT_A), Some("fh"), false);
        let decision = detect_changes(Some(&status), COMMIT_A, "other");
        assert!(decision.should_apply);
        assert!(decision.files_changed);
    }

    #[test]
    fn fresh_resource_always_applies() {
        let decision = detect_changes(None, COMMIT_A, "");
        assert!(decision.should_apply);
    }

    #[test]
    fn empty_files_hash_matches_missing_status_field() {
        // A spec without additionalFiles hashes to "" and a status that
        // never recorded one must compare equal, not retrigger.
        let status = status(Some(COMMIT_A), None, false);
        let decision = detect_changes(Some(&status), COMMIT_A, "");
        assert!(!decision.should_apply);
    }

    #[test]
    fn full_install_requested_and_not_done() {
        let mut config_spec = spec("#host-a");
        config_spec.full_install = true;
        assert!(needs_full_install(&config_spec, None));
        assert!(needs_full_install(
            &config_spec,
            Some(&status(None, None, false))
        ));
    }

    #[test]
    fn full_install_latch_is_monotone() {
        let mut config_spec = spec("#host-a");
        config_spec.full_install = true;
        // Once completed, nixos-anywhere is never selected again.
        assert!(!needs_full_install(
            &config_spec,
            Some(&status(Some(COMMIT_A), None, true))
        ));
    }

    #[test]
    fn no_full_install_without_spec_flag() {
        let config_spec = spec("#host-a");
        assert!(!needs_full_install(&config_spec, None));
    }

    #[test]
    fn source_defaults_to_git_repo() {
        let source = resolve_source(&spec("#host-a"));
        assert_eq!(source.repo_url, "https://git.example/o/r.git");
        assert_eq!(source.repo_name, "o/r");
        assert_eq!(source.flake_attr, "#host-a");
        assert_eq!(source.pinned_commit, None);
    }

    #[test]
    fn source_pins_commit_from_git_ref() {
        let mut config_spec = spec("#host-a");
        config_spec.git_ref = COMMIT_A.into();
        let source = resolve_source(&config_spec);
        assert_eq!(source.pinned_commit.as_deref(), Some(COMMIT_A));
    }

    #[test]
    fn source_accepts_full_github_flake_ref() {
        let source = resolve_source(&spec("github:owner/repo#host-a"));
        assert_eq!(source.repo_url, "https://github.com/owner/repo.git");
        assert_eq!(source.repo_name, "owner/repo");
        assert_eq!(source.flake_attr, "#host-a");
        assert_eq!(source.pinned_commit, None);

        let pinned = resolve_source(&spec(&format!("github:owner/repo/{COMMIT_A}#host-a")));
        assert_eq!(pinned.pinned_commit.as_deref(), Some(COMMIT_A));
    }

    #[test]
    fn rebuild_command_shape() {
        let plan = compose_apply_command(
            "root",
            "10.0.0.5",
            Path::new("/work/cfg"),
            "#host-a",
            None,
            false,
        );
        assert_eq!(plan.build_type, "nixos-rebuild");
        assert_eq!(
            plan.command.display_line(),
            "nix --extra-experimental-features nix-command flakes shell \
             nixpkgs#nixos-rebuild --command nixos-rebuild switch \
             --flake /work/cfg#host-a --target-host root@10.0.0.5"
        );
        assert!(plan.command.env.is_empty());
    }

    #[test]
    fn rebuild_with_key_uses_nix_sshopts() {
        let plan = compose_apply_command(
            "root",
            "10.0.0.5",
            Path::new("/work/cfg"),
            "#host-a",
            Some(Path::new("/dev/shm/nio-nix-keys/ssh_key_x")),
            false,
        );
        assert_eq!(
            plan.command.env,
            vec![(
                "NIX_SSHOPTS".to_string(),
                "-i /dev/shm/nio-nix-keys/ssh_key_x".to_string()
            )]
        );
        // The key path must not leak into the argument vector.
        assert!(!plan.command.display_line().contains("ssh_key_x"));
    }

    #[test]
    fn full_install_command_shape() {
        let plan = compose_apply_command(
            "root",
            "10.0.0.5",
            Path::new("/work/cfg"),
            "#host-a",
            Some(Path::new("/tmp/key")),
            true,
        );
        assert_eq!(plan.build_type, "nixos-anywhere");
        assert_eq!(
            plan.command.display_line(),
            "nix --extra-experimental-features nix-command flakes run \
             github:nix-community/nixos-anywhere -- --target-host root@10.0.0.5 \
             --flake /work/cfg#host-a -i /tmp/key"
        );
        // nixos-anywhere takes the key as an argument, not via NIX_SSHOPTS.
        assert!(plan.command.env.is_empty());
    }

    #[test]
    fn remove_flake_substitutes_attribute() {
        let plan = compose_apply_command(
            "root",
            "10.0.0.5",
            Path::new("/work/cfg"),
            "#unprovision",
            None,
            false,
        );
        assert!(plan
            .command
            .display_line()
            .contains("--flake /work/cfg#unprovision"));
        assert_eq!(plan.build_type, "nixos-rebuild");
    }
}
