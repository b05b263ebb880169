//! # Controller Context
//!
//! Shared state constructed once at startup and threaded into every
//! reconciler as `Arc<ControllerContext>`. There is no module-level
//! mutability: the Kubernetes client, configuration, known-hosts store,
//! event publisher and command runner all live here.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing::debug;

use crate::config::ControllerConfig;
use crate::crd::{ConfigurationStatusPatch, Machine, MachineStatusPatch, NixosConfiguration};
use crate::error::{Error, Result};
use crate::events::EventPublisher;
use crate::known_hosts::KnownHostsStore;
use crate::runner::{CommandRunner, SubprocessRunner};

/// Field manager used for all status patches.
const FIELD_MANAGER: &str = "nixos-infra-controller";

/// Everything a reconcile needs, owned once per process.
#[derive(Clone)]
pub struct ControllerContext {
    pub client: Client,
    pub config: Arc<ControllerConfig>,
    pub known_hosts: Arc<KnownHostsStore>,
    pub events: EventPublisher,
    pub runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ControllerContext {
    /// Build the context with the production subprocess runner.
    pub fn new(
        client: Client,
        config: ControllerConfig,
        known_hosts: KnownHostsStore,
    ) -> Self {
        let events = EventPublisher::new(client.clone());
        Self {
            client,
            config: Arc::new(config),
            known_hosts: Arc::new(known_hosts),
            events,
            runner: Arc::new(SubprocessRunner),
        }
    }

    /// Replace the command runner (tests use a recording implementation).
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Fetch the Machine referenced by a configuration.
    pub async fn get_machine(&self, namespace: &str, name: &str) -> Result<Machine> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|err| match err {
            kube::Error::Api(ref response) if response.code == 404 => Error::Credential(format!(
                "machine {namespace}/{name} not found"
            )),
            other => other.into(),
        })
    }

    /// Fetch a configuration by name (used by out-of-band tooling; the
    /// control loop itself receives objects from the watch stream).
    pub async fn get_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<NixosConfiguration> {
        let api: Api<NixosConfiguration> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    /// Read a secret and decode every entry as UTF-8.
    ///
    /// A missing secret or undecodable entry is a credential error; the
    /// reconcile skips this tick rather than retrying in a tight loop.
    pub async fn read_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<BTreeMap<String, String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await.map_err(|err| match err {
            kube::Error::Api(ref response) if response.code == 404 => {
                Error::Credential(format!("secret {namespace}/{name} not found"))
            }
            other => other.into(),
        })?;

        let mut data = BTreeMap::new();
        for (key, bytes) in secret.data.unwrap_or_default() {
            let value = String::from_utf8(bytes.0).map_err(|_| {
                Error::Credential(format!("secret {namespace}/{name} key {key} is not UTF-8"))
            })?;
            data.insert(key, value);
        }
        debug!(secret = %format!("{namespace}/{name}"), keys = data.len(), "read secret");
        Ok(data)
    }

    /// Merge-patch the Machine status subresource.
    pub async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: MachineStatusPatch,
    ) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch.into_merge_patch()),
        )
        .await?;
        Ok(())
    }

    /// Merge-patch the NixosConfiguration status subresource.
    pub async fn patch_configuration_status(
        &self,
        namespace: &str,
        name: &str,
        patch: ConfigurationStatusPatch,
    ) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let api: Api<NixosConfiguration> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch.into_merge_patch()),
        )
        .await?;
        Ok(())
    }
}
