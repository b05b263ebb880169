//! # Machine Reconciler
//!
//! Keeps `Machine.status` in sync with reality: an SSH reachability probe
//! on every pass (the controller requeues at the discovery interval) and a
//! hardware scan once the scan interval has elapsed on a discoverable
//! machine. The first pass also initializes `hasConfiguration: false`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use crate::context::ControllerContext;
use crate::crd::{Machine, MachineStatusPatch};
use crate::error::Error;
use crate::facts::parse_facts;
use crate::observability::metrics;
use crate::ssh::{establish_session, SshSession};

/// Sentinel echoed over SSH to verify a live round-trip.
const PROBE_SENTINEL: &str = "machine_available";

/// Timeout for the probe and the scan commands; these are short remote
/// invocations, nowhere near the apply ceiling.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const SCAN_TIMEOUT: Duration = Duration::from_secs(120);

/// Open a session and run the `echo` sentinel round-trip.
///
/// Any failure (credentials, connect, host-key mismatch) means "not
/// discoverable"; the reason is logged, never propagated.
pub async fn probe_discoverable(
    ctx: &ControllerContext,
    machine: &Machine,
    namespace: &str,
    owner: &ObjectReference,
) -> bool {
    let session = match establish_session(ctx, &machine.spec, namespace, owner).await {
        Ok(session) => session,
        Err(err) => {
            warn!(
                hostname = %machine.spec.hostname,
                error = %err,
                "failed to prepare ssh session for probe"
            );
            metrics::record_ssh_probe(false);
            return false;
        }
    };

    let reachable = match session
        .run(ctx, &["echo", PROBE_SENTINEL], PROBE_TIMEOUT)
        .await
    {
        Ok(outcome) if outcome.success => outcome
            .stdout_tail
            .iter()
            .any(|line| line.trim() == PROBE_SENTINEL),
        Ok(_) | Err(_) => false,
    };

    metrics::record_ssh_probe(reachable);
    if !reachable {
        warn!(hostname = %machine.spec.hostname, "machine availability check failed");
    }
    reachable
}

fn scan_due(machine: &Machine, interval: Duration) -> bool {
    let last = machine
        .status
        .as_ref()
        .and_then(|s| s.last_hardware_scan_time.as_deref())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
    match last {
        Some(last) => {
            let elapsed = Utc::now().signed_duration_since(last.with_timezone(&Utc));
            elapsed.num_seconds() >= interval.as_secs() as i64
        }
        None => true,
    }
}

/// Upload the scanner script, run it, and parse its stdout into facts.
async fn scan_hardware(
    ctx: &ControllerContext,
    session: &SshSession,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    let scanner = &ctx.config.hardware_scanner_path;
    if !scanner.exists() {
        warn!(path = %scanner.display(), "hardware scanner script not found, skipping scan");
        return None;
    }
    let remote_path = ctx.config.remote_hardware_script_path.as_str();

    let upload = session.upload(ctx, scanner, remote_path, SCAN_TIMEOUT).await;
    match upload {
        Ok(outcome) if outcome.success => {}
        Ok(outcome) => {
            warn!(
                host = %session.host(),
                stderr = %outcome.stderr_summary(),
                "failed to upload hardware scanner"
            );
            return None;
        }
        Err(err) => {
            warn!(host = %session.host(), error = %err, "failed to upload hardware scanner");
            return None;
        }
    }

    let chmod = session.command(&["chmod", "+x", remote_path]);
    match ctx.runner.run_captured(&chmod, SCAN_TIMEOUT).await {
        Ok(output) if output.success => {}
        other => {
            warn!(host = %session.host(), result = ?other.err(), "chmod of scanner failed");
            return None;
        }
    }

    let run = session.command(&[remote_path]);
    let output = match ctx.runner.run_captured(&run, SCAN_TIMEOUT).await {
        Ok(output) if output.success => output,
        Ok(output) => {
            warn!(
                host = %session.host(),
                exit_code = ?output.exit_code,
                "hardware scanner exited non-zero"
            );
            return None;
        }
        Err(err) => {
            warn!(host = %session.host(), error = %err, "hardware scanner failed");
            return None;
        }
    };

    if output.stdout.trim().is_empty() {
        warn!(host = %session.host(), "hardware scanner returned empty output");
        return None;
    }

    Some(parse_facts(output.stdout.lines()))
}

/// One reconcile pass for a Machine.
pub async fn reconcile(
    machine: Arc<Machine>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, Error> {
    metrics::increment_machine_reconciliations();

    let namespace = machine.namespace().unwrap_or_else(|| "default".to_string());
    let name = machine.name_any();
    let owner = machine.object_ref(&());
    debug!(machine = %format!("{namespace}/{name}"), "reconciling machine");

    let previously_discoverable = machine
        .status
        .as_ref()
        .and_then(|s| s.discoverable)
        .unwrap_or(false);
    let is_first_pass = machine.status.is_none();

    let discoverable = probe_discoverable(&ctx, &machine, &namespace, &owner).await;

    match (previously_discoverable, discoverable) {
        (false, true) => metrics::adjust_machines_discoverable(1),
        (true, false) => metrics::adjust_machines_discoverable(-1),
        _ => {}
    }

    let mut patch = MachineStatusPatch::new();
    if is_first_pass {
        patch = patch.discoverable(discoverable).has_configuration(false);
    } else if previously_discoverable != discoverable {
        patch = patch.discoverable(discoverable);
    }

    if discoverable && scan_due(&machine, ctx.config.hardware_scan_interval) {
        let session = establish_session(&ctx, &machine.spec, &namespace, &owner).await;
        if let Ok(session) = session {
            if let Some(facts) = scan_hardware(&ctx, &session).await {
                info!(machine = %name, facts = facts.len(), "hardware scan complete");
                patch = patch
                    .hardware_facts(facts)
                    .last_hardware_scan_time(&Utc::now().to_rfc3339());
            }
        }
    }

    ctx.patch_machine_status(&namespace, &name, patch).await?;

    Ok(Action::requeue(ctx.config.machine_discovery_interval))
}

/// Requeue policy for machine reconcile errors.
pub fn error_policy(machine: Arc<Machine>, error: &Error, _ctx: Arc<ControllerContext>) -> Action {
    warn!(
        machine = %machine.name_any(),
        error = %error,
        "machine reconciliation error"
    );
    metrics::increment_reconciliation_errors(error.kind());
    Action::requeue(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachineSpec, MachineStatus};

    fn machine_with_scan_time(time: Option<String>) -> Machine {
        let mut machine = Machine::new(
            "mach-a",
            MachineSpec {
                hostname: "10.0.0.5".into(),
                ip_address: None,
                ssh_user: "root".into(),
                ssh_key_secret_ref: None,
                ssh_password_secret_ref: None,
                mac_address: None,
            },
        );
        machine.status = Some(MachineStatus {
            discoverable: Some(true),
            last_hardware_scan_time: time,
            ..MachineStatus::default()
        });
        machine
    }

    #[test]
    fn scan_due_when_never_scanned() {
        let machine = machine_with_scan_time(None);
        assert!(scan_due(&machine, Duration::from_secs(300)));
    }

    #[test]
    fn scan_due_after_interval() {
        let old = (Utc::now() - chrono::Duration::seconds(600)).to_rfc3339();
        let machine = machine_with_scan_time(Some(old));
        assert!(scan_due(&machine, Duration::from_secs(300)));
    }

    #[test]
    fn scan_not_due_within_interval() {
        let recent = Utc::now().to_rfc3339();
        let machine = machine_with_scan_time(Some(recent));
        assert!(!scan_due(&machine, Duration::from_secs(300)));
    }

    #[test]
    fn scan_due_on_unparseable_timestamp() {
        let machine = machine_with_scan_time(Some("not-a-time".into()));
        assert!(scan_due(&machine, Duration::from_secs(300)));
    }
}
