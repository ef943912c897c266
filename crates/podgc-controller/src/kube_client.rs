// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live-cluster implementations of the engine's API traits.
//!
//! [`KubeCluster`] reads pods with list + `kube::runtime::watcher`, mutates
//! them with JSON merge patches and background deletes, and signals
//! containers through the exec subresource.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod as KubePod;
use kube::Client;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::{WatchStreamExt, watcher};
use nix::sys::signal::Signal;
use serde_json::Value;
use tracing::debug;

use podgc_core::client::{
    ApiError, DeleteOptions, PodClient, PodSource, PropagationPolicy, SourceEvent,
};
use podgc_core::pod::Pod;
use podgc_core::selector::Selector;
use podgc_core::signal::{ContainerSignaller, kill_command};

use crate::convert::pod_from_k8s;

/// Map a client error onto the engine's retry taxonomy.
pub fn api_error(error: kube::Error) -> ApiError {
    match error {
        kube::Error::Api(response) => ApiError::from_status(response.code, response.message),
        kube::Error::HyperError(e) => ApiError::Transport(e.to_string()),
        kube::Error::Service(e) => ApiError::Transport(e.to_string()),
        other => ApiError::Other(other.to_string()),
    }
}

fn propagation_policy(policy: PropagationPolicy) -> kube::api::PropagationPolicy {
    match policy {
        PropagationPolicy::Background => kube::api::PropagationPolicy::Background,
        PropagationPolicy::Foreground => kube::api::PropagationPolicy::Foreground,
        PropagationPolicy::Orphan => kube::api::PropagationPolicy::Orphan,
    }
}

/// Pod API backed by a Kubernetes client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the in-cluster config or the local kubeconfig.
    pub async fn try_default() -> Result<Self, kube::Error> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn pods(&self, namespace: &str) -> Api<KubePod> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

#[async_trait]
impl PodClient for KubeCluster {
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), ApiError> {
        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ApiError> {
        let params = DeleteParams {
            propagation_policy: Some(propagation_policy(options.propagation)),
            grace_period_seconds: options
                .grace_period_seconds
                .map(|secs| u32::try_from(secs.max(0)).unwrap_or(u32::MAX)),
            ..Default::default()
        };
        self.pods(namespace)
            .delete(name, &params)
            .await
            .map_err(api_error)?;
        Ok(())
    }
}

#[async_trait]
impl PodSource for KubeCluster {
    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>, ApiError> {
        let params = ListParams::default().labels(&selector.to_string());
        let pods = self
            .pods(namespace)
            .list(&params)
            .await
            .map_err(api_error)?;
        Ok(pods.items.iter().map(pod_from_k8s).collect())
    }

    fn watch(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> BoxStream<'static, Result<SourceEvent, ApiError>> {
        let config = watcher::Config::default().labels(&selector.to_string());
        // a relist arrives as Init, InitApply..., InitDone
        let mut relist: Vec<Pod> = Vec::new();

        watcher(self.pods(namespace), config)
            .default_backoff()
            .filter_map(move |event| {
                let event = match event {
                    Ok(watcher::Event::Init) => {
                        relist.clear();
                        None
                    }
                    Ok(watcher::Event::InitApply(pod)) => {
                        relist.push(pod_from_k8s(&pod));
                        None
                    }
                    Ok(watcher::Event::InitDone) => {
                        debug!(pods = relist.len(), "Pod watch relisted");
                        Some(Ok(SourceEvent::Restarted(std::mem::take(&mut relist))))
                    }
                    Ok(watcher::Event::Apply(pod)) => {
                        Some(Ok(SourceEvent::Applied(pod_from_k8s(&pod))))
                    }
                    Ok(watcher::Event::Delete(pod)) => {
                        Some(Ok(SourceEvent::Deleted(pod_from_k8s(&pod))))
                    }
                    Err(e) => Some(Err(ApiError::Transport(e.to_string()))),
                };
                futures::future::ready(event)
            })
            .boxed()
    }
}

#[async_trait]
impl ContainerSignaller for KubeCluster {
    async fn signal(&self, pod: &Pod, container: &str, signal: Signal) -> Result<(), ApiError> {
        let command = kill_command(pod, container, signal);
        debug!(pod = %pod.key(), container, command = ?command, "Exec kill command");

        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(true);
        let mut process = self
            .pods(&pod.namespace)
            .exec(&pod.name, command, &params)
            .await
            .map_err(api_error)?;

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        process
            .join()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        match status {
            Some(status) if status.status.as_deref() == Some("Failure") => Err(ApiError::Other(
                status.message.unwrap_or_else(|| "kill command failed".to_string()),
            )),
            _ => Ok(()),
        }
    }
}
