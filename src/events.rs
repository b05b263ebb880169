//! # Event Bus
//!
//! Kubernetes Events attached to the owning resource. Emission is
//! best-effort: a failed publish is logged and swallowed so an event
//! hiccup can never fail a reconcile.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::{info, warn};

/// Event reasons emitted by the controller.
pub mod reason {
    pub const MISSING_SSH_KEY: &str = "MissingSSHKey";
    pub const MISSING_PASSWORD: &str = "MissingPassword";
    pub const SECRET_NOT_FOUND: &str = "SecretNotFound";
    pub const CONFIGURATION_APPLIED: &str = "ConfigurationApplied";
    pub const MACHINE_NOT_DISCOVERABLE: &str = "MachineNotDiscoverable";
    pub const BUILD_FAILED: &str = "BuildFailed";
}

/// Publishes controller events against owning resources.
#[derive(Clone)]
pub struct EventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher").finish_non_exhaustive()
    }
}

impl EventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter: Reporter = "nixos-infra-controller".into();
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: &str,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, reference).await {
            warn!(reason, error = %err, "failed to emit event");
        }
    }

    /// `Warning` event (missing credentials, build failures).
    pub async fn warn(&self, reference: &ObjectReference, reason: &str, note: &str) {
        warn!(reason, note, "emitting warning event");
        self.publish(reference, EventType::Warning, reason, note)
            .await;
    }

    /// `Normal` event (configuration applied).
    pub async fn normal(&self, reference: &ObjectReference, reason: &str, note: &str) {
        info!(reason, note, "emitting event");
        self.publish(reference, EventType::Normal, reason, note)
            .await;
    }
}
