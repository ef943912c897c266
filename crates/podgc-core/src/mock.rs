// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cluster for testing.
//!
//! [`MockCluster`] implements [`PodSource`], [`PodClient`] and
//! [`ContainerSignaller`] over a map of pods. Patches and deletes change the
//! stored pods and are pushed to open watch streams, so an engine wired to the
//! mock converges the same way it would against a real API server. Every call
//! is recorded, and failures can be injected per operation.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use nix::sys::signal::Signal;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::client::{ApiError, DeleteOptions, PodClient, PodSource, SourceEvent};
use crate::pod::{Pod, pod_key};
use crate::selector::Selector;
use crate::signal::ContainerSignaller;

/// A recorded patch call.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchCall {
    /// `{namespace}/{name}`
    pub pod: String,
    /// The merge patch sent.
    pub patch: Value,
}

/// A recorded delete call.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCall {
    /// `{namespace}/{name}`
    pub pod: String,
    /// Options sent with the delete.
    pub options: DeleteOptions,
}

/// A recorded signal call.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalCall {
    /// `{namespace}/{name}`
    pub pod: String,
    /// Target container.
    pub container: String,
    /// Signal delivered.
    pub signal: Signal,
}

struct Watcher {
    namespace: String,
    selector: Selector,
    tx: mpsc::UnboundedSender<Result<SourceEvent, ApiError>>,
}

impl Watcher {
    fn selects(&self, pod: &Pod) -> bool {
        (self.namespace.is_empty() || self.namespace == pod.namespace)
            && self.selector.matches(&pod.labels)
    }
}

#[derive(Default)]
struct MockState {
    pods: BTreeMap<String, Pod>,
    next_version: u64,
    watchers: Vec<Watcher>,
    patches: Vec<PatchCall>,
    deletes: Vec<DeleteCall>,
    signals: Vec<SignalCall>,
    patch_failures: VecDeque<ApiError>,
    delete_failures: VecDeque<ApiError>,
    list_failures: VecDeque<ApiError>,
    failing_containers: HashSet<String>,
}

impl MockState {
    fn bump(&mut self, pod: &mut Pod) {
        self.next_version += 1;
        pod.resource_version = self.next_version.to_string();
    }

    /// Push the transition `old -> new` to every watcher.
    fn publish(&mut self, old: Option<&Pod>, new: Option<&Pod>) {
        self.watchers.retain(|w| {
            let was = old.is_some_and(|p| w.selects(p));
            let event = match new {
                Some(pod) if w.selects(pod) => Some(SourceEvent::Applied(pod.clone())),
                Some(pod) if was => Some(SourceEvent::Deleted(pod.clone())),
                None if was => old.cloned().map(SourceEvent::Deleted),
                _ => None,
            };
            match event {
                Some(event) => w.tx.send(Ok(event)).is_ok(),
                None => !w.tx.is_closed(),
            }
        });
    }

    fn store(&mut self, mut pod: Pod) {
        self.bump(&mut pod);
        let key = pod.key();
        let old = self.pods.insert(key, pod.clone());
        self.publish(old.as_ref(), Some(&pod));
    }

    fn remove(&mut self, key: &str) -> Option<Pod> {
        let old = self.pods.remove(key)?;
        self.publish(Some(&old), None);
        Some(old)
    }
}

/// In-memory pod API.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace a pod, assigning a fresh resourceVersion.
    pub fn apply_pod(&self, pod: Pod) {
        self.lock().store(pod);
    }

    /// Modify a stored pod in place. Returns `false` if it does not exist.
    pub fn update_pod(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Pod)) -> bool {
        let mut state = self.lock();
        let Some(mut pod) = state.pods.get(&pod_key(namespace, name)).cloned() else {
            return false;
        };
        f(&mut pod);
        state.store(pod);
        true
    }

    /// Remove a pod as if it had been garbage collected by the cluster.
    pub fn remove_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock().remove(&pod_key(namespace, name))
    }

    /// Current state of a pod.
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock().pods.get(&pod_key(namespace, name)).cloned()
    }

    /// Fail the next patch with `error`.
    pub fn fail_next_patch(&self, error: ApiError) {
        self.lock().patch_failures.push_back(error);
    }

    /// Fail the next delete with `error`.
    pub fn fail_next_delete(&self, error: ApiError) {
        self.lock().delete_failures.push_back(error);
    }

    /// Fail the next list with `error`.
    pub fn fail_next_list(&self, error: ApiError) {
        self.lock().list_failures.push_back(error);
    }

    /// Make every signal sent to `container` fail.
    pub fn fail_signals_to(&self, container: &str) {
        self.lock().failing_containers.insert(container.to_string());
    }

    /// Push an error into every open watch stream.
    pub fn break_watches(&self, error: ApiError) {
        let mut state = self.lock();
        state.watchers.retain(|w| w.tx.send(Err(error.clone())).is_ok());
    }

    /// Patches received so far.
    pub fn patches(&self) -> Vec<PatchCall> {
        self.lock().patches.clone()
    }

    /// Deletes received so far.
    pub fn deletes(&self) -> Vec<DeleteCall> {
        self.lock().deletes.clone()
    }

    /// Signals received so far.
    pub fn signals(&self) -> Vec<SignalCall> {
        self.lock().signals.clone()
    }

    /// Total mutating calls (patch, delete, signal).
    pub fn api_calls(&self) -> usize {
        let state = self.lock();
        state.patches.len() + state.deletes.len() + state.signals.len()
    }
}

fn apply_merge_patch(pod: &mut Pod, patch: &Value) -> Result<(), ApiError> {
    let Some(metadata) = patch.get("metadata") else {
        return Ok(());
    };

    if let Some(version) = metadata.get("resourceVersion").and_then(Value::as_str)
        && version != pod.resource_version
    {
        return Err(ApiError::Conflict(format!(
            "Operation cannot be fulfilled on pods \"{}\": the object has been modified",
            pod.name
        )));
    }

    if let Some(labels) = metadata.get("labels").and_then(Value::as_object) {
        for (key, value) in labels {
            match value.as_str() {
                Some(v) => {
                    pod.labels.insert(key.clone(), v.to_string());
                }
                None => {
                    pod.labels.remove(key);
                }
            }
        }
    }

    if let Some(finalizers) = metadata.get("finalizers").and_then(Value::as_array) {
        pod.finalizers = finalizers
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    Ok(())
}

#[async_trait]
impl PodClient for MockCluster {
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), ApiError> {
        let mut state = self.lock();
        let key = pod_key(namespace, name);
        state.patches.push(PatchCall {
            pod: key.clone(),
            patch: patch.clone(),
        });
        if let Some(error) = state.patch_failures.pop_front() {
            return Err(error);
        }

        let mut pod = state
            .pods
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("pods \"{name}\" not found")))?;
        apply_merge_patch(&mut pod, patch)?;

        // finalizers were holding back a requested delete
        if pod.deletion_timestamp.is_some() && pod.finalizers.is_empty() {
            state.remove(&key);
        } else {
            state.store(pod);
        }
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ApiError> {
        let mut state = self.lock();
        let key = pod_key(namespace, name);
        state.deletes.push(DeleteCall {
            pod: key.clone(),
            options: options.clone(),
        });
        if let Some(error) = state.delete_failures.pop_front() {
            return Err(error);
        }

        let mut pod = state
            .pods
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("pods \"{name}\" not found")))?;
        if pod.finalizers.is_empty() {
            state.remove(&key);
        } else if pod.deletion_timestamp.is_none() {
            pod.deletion_timestamp = Some(Utc::now());
            state.store(pod);
        }
        Ok(())
    }
}

#[async_trait]
impl PodSource for MockCluster {
    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>, ApiError> {
        let mut state = self.lock();
        if let Some(error) = state.list_failures.pop_front() {
            return Err(error);
        }
        Ok(state
            .pods
            .values()
            .filter(|p| namespace.is_empty() || p.namespace == namespace)
            .filter(|p| selector.matches(&p.labels))
            .cloned()
            .collect())
    }

    fn watch(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> BoxStream<'static, Result<SourceEvent, ApiError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push(Watcher {
            namespace: namespace.to_string(),
            selector: selector.clone(),
            tx,
        });
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }
}

#[async_trait]
impl ContainerSignaller for MockCluster {
    async fn signal(&self, pod: &Pod, container: &str, signal: Signal) -> Result<(), ApiError> {
        let mut state = self.lock();
        state.signals.push(SignalCall {
            pod: pod.key(),
            container: container.to_string(),
            signal,
        });
        if state.failing_containers.contains(container) {
            return Err(ApiError::Transport(format!(
                "unable to upgrade connection to container {container}"
            )));
        }
        Ok(())
    }
}
