// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Indexed local mirror of workflow pods.
//!
//! The cache is fed by the watch task (the only writer) and read by cleanup
//! workers and the workflow reconciler. Reads never reach the API server.
//!
//! Every add and delete is forwarded to the registered [`PodEventHandler`].
//! Updates are forwarded only when something the controller cares about
//! changed (see [`significant_pod_change`]); resourceVersion bumps and other
//! metadata churn stay local.
//!
//! When the handler fails, the pod is remembered as undelivered and the next
//! observation of it (a resync carrying the same resourceVersion, or any later
//! update) is forwarded again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::SourceEvent;
use crate::pod::{ContainerStatus, Pod, PodPhase, pod_key};

/// Receives pod changes that may affect workflow state.
#[async_trait]
pub trait PodEventHandler: Send + Sync {
    /// Called for every add, delete and significant update.
    async fn on_pod_event(&self, pod: &Pod) -> anyhow::Result<()>;
}

/// Secondary indices maintained by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodIndex {
    /// `{namespace}/{workflow name}`
    Workflow,
    /// Workflow node ID label.
    NodeId,
    /// Pod phase.
    Phase,
}

impl PodIndex {
    const ALL: [PodIndex; 3] = [PodIndex::Workflow, PodIndex::NodeId, PodIndex::Phase];

    fn value(&self, pod: &Pod) -> Option<String> {
        match self {
            PodIndex::Workflow => pod.workflow_name().map(|wf| pod_key(&pod.namespace, wf)),
            PodIndex::NodeId => pod.node_id().map(str::to_string),
            PodIndex::Phase => Some(pod.phase.as_str().to_string()),
        }
    }
}

/// A typed change to the cache contents.
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// First time the pod was seen.
    Added(Arc<Pod>),
    /// The pod changed.
    Modified {
        /// Previous snapshot.
        old: Arc<Pod>,
        /// Current snapshot.
        new: Arc<Pod>,
    },
    /// The pod is gone.
    Deleted(Arc<Pod>),
}

/// True when the deletion timestamp went from unset to set.
pub fn started_terminating(old: &Pod, new: &Pod) -> bool {
    old.deletion_timestamp.is_none() && new.deletion_timestamp.is_some()
}

/// Whether an update matters to the controller.
pub fn significant_pod_change(old: &Pod, new: &Pod) -> bool {
    old.node_name != new.node_name
        || old.phase != new.phase
        || old.message != new.message
        || old.pod_ip != new.pod_ip
        || old.deletion_timestamp != new.deletion_timestamp
        || old.labels != new.labels
        || old.annotations != new.annotations
        || old.finalizers != new.finalizers
        || significant_container_statuses_change(&old.container_statuses, &new.container_statuses)
}

fn significant_container_statuses_change(old: &[ContainerStatus], new: &[ContainerStatus]) -> bool {
    if old.len() != new.len() {
        return true;
    }
    new.iter().any(|n| {
        old.iter()
            .find(|o| o.name == n.name)
            .is_none_or(|o| o.ready != n.ready || o.state != n.state)
    })
}

#[derive(Default)]
struct Store {
    pods: HashMap<String, Arc<Pod>>,
    indices: HashMap<PodIndex, HashMap<String, HashSet<String>>>,
    /// Pods whose last event the handler rejected.
    undelivered: HashSet<String>,
}

impl Store {
    fn index(&mut self, key: &str, pod: &Pod) {
        for index in PodIndex::ALL {
            if let Some(value) = index.value(pod) {
                self.indices
                    .entry(index)
                    .or_default()
                    .entry(value)
                    .or_default()
                    .insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str, pod: &Pod) {
        for index in PodIndex::ALL {
            let Some(value) = index.value(pod) else {
                continue;
            };
            if let Some(by_value) = self.indices.get_mut(&index)
                && let Some(keys) = by_value.get_mut(&value)
            {
                keys.remove(key);
                if keys.is_empty() {
                    by_value.remove(&value);
                }
            }
        }
    }

    fn upsert(&mut self, pod: Pod) -> PodEvent {
        let key = pod.key();
        let new = Arc::new(pod);
        match self.pods.insert(key.clone(), new.clone()) {
            Some(old) => {
                self.unindex(&key, &old);
                self.index(&key, &new);
                PodEvent::Modified { old, new }
            }
            None => {
                self.index(&key, &new);
                PodEvent::Added(new)
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<Arc<Pod>> {
        let old = self.pods.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }
}

/// Indexed, eventually-consistent pod cache.
pub struct PodCache {
    store: RwLock<Store>,
    handler: Option<Arc<dyn PodEventHandler>>,
    synced: AtomicBool,
}

impl Default for PodCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PodCache {
    /// Create an empty cache with no event handler.
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
            handler: None,
            synced: AtomicBool::new(false),
        }
    }

    /// Create an empty cache that forwards events to `handler`.
    pub fn with_handler(handler: Arc<dyn PodEventHandler>) -> Self {
        Self {
            handler: Some(handler),
            ..Self::new()
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a pod. Never calls the API.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.read().pods.get(&pod_key(namespace, name)).cloned()
    }

    /// Pods whose `index` value equals `value`.
    pub fn list_by_index(&self, index: PodIndex, value: &str) -> Vec<Arc<Pod>> {
        let store = self.read();
        let Some(keys) = store.indices.get(&index).and_then(|m| m.get(value)) else {
            return Vec::new();
        };
        let mut pods: Vec<Arc<Pod>> = keys
            .iter()
            .filter_map(|key| store.pods.get(key).cloned())
            .collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        pods
    }

    /// Pods belonging to a workflow.
    pub fn pods_for_workflow(&self, namespace: &str, workflow: &str) -> Vec<Arc<Pod>> {
        self.list_by_index(PodIndex::Workflow, &pod_key(namespace, workflow))
    }

    /// Pods executing a workflow node.
    pub fn pods_for_node(&self, node_id: &str) -> Vec<Arc<Pod>> {
        self.list_by_index(PodIndex::NodeId, node_id)
    }

    /// Pods in a phase.
    pub fn pods_in_phase(&self, phase: PodPhase) -> Vec<Arc<Pod>> {
        self.list_by_index(PodIndex::Phase, phase.as_str())
    }

    fn count_in_phase(&self, phase: PodPhase) -> usize {
        self.read()
            .indices
            .get(&PodIndex::Phase)
            .and_then(|m| m.get(phase.as_str()))
            .map_or(0, HashSet::len)
    }

    /// Number of cached Running and Pending pods.
    pub fn phase_metrics(&self) -> HashMap<PodPhase, i64> {
        [PodPhase::Running, PodPhase::Pending]
            .into_iter()
            .map(|phase| (phase, self.count_in_phase(phase) as i64))
            .collect()
    }

    /// Number of cached pods.
    pub fn len(&self) -> usize {
        self.read().pods.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the initial listing has been loaded.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Apply one event from the pod source.
    pub async fn apply(&self, event: SourceEvent) {
        match event {
            SourceEvent::Applied(pod) => {
                let event = self.write().upsert(pod);
                self.dispatch(event).await;
            }
            SourceEvent::Deleted(pod) => {
                let key = pod.key();
                let removed = self.write().remove(&key);
                // the watch may deliver a delete for a pod we never saw; still report it
                let pod = removed.unwrap_or_else(|| Arc::new(pod));
                self.dispatch(PodEvent::Deleted(pod)).await;
            }
            SourceEvent::Restarted(pods) => self.replace(pods).await,
        }
    }

    /// Replace the whole content with a fresh listing and mark the cache synced.
    pub async fn replace(&self, pods: Vec<Pod>) {
        let events = {
            let mut store = self.write();
            let incoming: HashSet<String> = pods.iter().map(Pod::key).collect();
            let stale: Vec<String> = store
                .pods
                .keys()
                .filter(|key| !incoming.contains(*key))
                .cloned()
                .collect();

            let mut events: Vec<PodEvent> = stale
                .iter()
                .filter_map(|key| store.remove(key))
                .map(PodEvent::Deleted)
                .collect();
            events.extend(pods.into_iter().map(|pod| store.upsert(pod)));
            events
        };

        debug!(events = events.len(), "Pod cache resynced");
        for event in events {
            self.dispatch(event).await;
        }
        self.synced.store(true, Ordering::Release);
    }

    async fn dispatch(&self, event: PodEvent) {
        match event {
            PodEvent::Added(pod) => self.notify(&pod).await,
            PodEvent::Modified { old, new } => {
                let redeliver = self.read().undelivered.contains(&new.key());
                if old.resource_version == new.resource_version && !redeliver {
                    return;
                }
                if !redeliver && !significant_pod_change(&old, &new) {
                    debug!(pod = %new.key(), resource_version = %new.resource_version, "Insignificant pod change");
                    return;
                }
                if started_terminating(&old, &new) {
                    info!(pod = %new.key(), "Termination event detected for pod");
                }
                self.notify(&new).await;
            }
            PodEvent::Deleted(pod) => {
                self.write().undelivered.remove(&pod.key());
                self.notify(&pod).await;
            }
        }
    }

    async fn notify(&self, pod: &Pod) {
        let Some(handler) = &self.handler else {
            return;
        };
        match handler.on_pod_event(pod).await {
            Ok(()) => {
                self.write().undelivered.remove(&pod.key());
            }
            Err(e) => {
                warn!(pod = %pod.key(), error = %e, "Pod event callback failed");
                if self.read().pods.contains_key(&pod.key()) {
                    self.write().undelivered.insert(pod.key());
                }
            }
        }
    }
}
