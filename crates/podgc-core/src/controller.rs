// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cleanup workers and the helpers that feed them.
//!
//! [`PodGcController`] owns the cleanup queue. Reconcilers enqueue work through
//! [`PodGcController::enact_any_pod_cleanup`], [`PodGcController::queue_workflow_pods`],
//! [`PodGcController::terminate_containers`] and [`PodGcController::delete_pod`];
//! workers pop encoded [`CleanupKey`]s and apply them against the cluster.
//!
//! Per action:
//!
//! - `TerminateContainers`: a pod that never started is deleted instead.
//!   Otherwise running containers get SIGTERM and `KillContainers` is
//!   scheduled after the pod's grace period.
//! - `KillContainers`: running containers get SIGKILL.
//! - `LabelPodCompleted`: label `completed=true`, dropping the status
//!   finalizer when capture is enabled.
//! - `DeletePod`: the same patch, then a background delete.
//! - `RemoveFinalizer`: drop the status finalizer only.
//!
//! Only the most recently enqueued of `DeletePod`, `LabelPodCompleted` and
//! `RemoveFinalizer` is applied to a pod; an older one still sitting in the
//! queue is dropped when it comes up.
//!
//! Failures classified as transient (including conflicts) are retried with
//! backoff; anything else is logged and dropped. A later pod event re-enqueues
//! the pod if it still needs work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::action::{CleanupAction, NodePhase, PodGc, PodGcStrategy, WorkflowPhase, resolve};
use crate::cache::PodCache;
use crate::client::{DeleteOptions, PodClient, PropagationPolicy};
use crate::error::Result;
use crate::key::{self, CleanupKey};
use crate::patch::cleanup_patch;
use crate::pod::{LABEL_COMPONENT, Pod, PodPhase, pod_key};
use crate::queue::{MAX_DELAY, QueueMetrics, RateLimiterConfig, WorkQueue, controller_rate_limiter};
use crate::selector::Selector;
use crate::signal::{ContainerSignaller, signal_running_containers};

/// Runtime settings for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; empty watches all namespaces.
    pub namespace: String,
    /// Controller instance ID.
    pub instance_id: String,
    /// Number of cleanup workers.
    pub workers: usize,
    /// Grace period passed on pod deletes; `None` uses the pod's own.
    pub grace_period_seconds: Option<i64>,
    /// Delay before deleting a pod unless the workflow overrides it.
    pub delete_delay: Duration,
    /// Remove the status-capture finalizer when labelling or deleting.
    pub capture_finalizer: bool,
    /// Retry backoff settings.
    pub rate_limiter: RateLimiterConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            instance_id: String::new(),
            workers: 4,
            grace_period_seconds: None,
            delete_delay: Duration::from_secs(5),
            capture_finalizer: false,
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

/// The parts of a workflow that pod GC needs.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGcContext {
    /// Workflow namespace.
    pub namespace: String,
    /// Workflow name.
    pub name: String,
    /// Current workflow phase.
    pub phase: WorkflowPhase,
    /// GC policy from the workflow spec.
    pub pod_gc: PodGc,
    /// Phase of every known node, by node ID.
    pub node_phases: HashMap<String, NodePhase>,
}

/// Queue owner and cleanup executor.
pub struct PodGcController {
    cache: Arc<PodCache>,
    queue: Arc<WorkQueue<String>>,
    client: Arc<dyn PodClient>,
    signaller: Arc<dyn ContainerSignaller>,
    config: ControllerConfig,
    /// Latest final action enqueued per pod, by `{namespace}/{name}`.
    latest: Mutex<HashMap<String, CleanupAction>>,
}

impl PodGcController {
    /// Create a controller reading pods from `cache`.
    pub fn new(
        cache: Arc<PodCache>,
        client: Arc<dyn PodClient>,
        signaller: Arc<dyn ContainerSignaller>,
        config: ControllerConfig,
    ) -> Self {
        let queue = WorkQueue::new(
            "pod_cleanup_queue",
            Box::new(controller_rate_limiter(&config.rate_limiter)),
        );
        Self {
            cache,
            queue: Arc::new(queue),
            client,
            signaller,
            config,
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// The pod cache this controller reads.
    pub fn cache(&self) -> &Arc<PodCache> {
        &self.cache
    }

    /// The cleanup queue (encoded keys).
    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// Controller settings.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Counts of cached Running and Pending pods.
    pub fn pod_phase_metrics(&self) -> HashMap<PodPhase, i64> {
        self.cache.phase_metrics()
    }

    /// Cleanup queue occupancy.
    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    /// Enqueue `action` for a pod, subject to the rate limiter.
    pub fn queue_pod_for_cleanup(
        &self,
        namespace: &str,
        name: &str,
        action: CleanupAction,
    ) -> Result<()> {
        if action == CleanupAction::None {
            return Ok(());
        }
        let key = CleanupKey::new(namespace, name, action)?;
        self.record(&key);
        self.queue.add_rate_limited(key.encode());
        Ok(())
    }

    /// Enqueue `action` for a pod once `delay` has elapsed.
    pub fn queue_pod_for_cleanup_after(
        &self,
        namespace: &str,
        name: &str,
        action: CleanupAction,
        delay: Duration,
    ) -> Result<()> {
        if action == CleanupAction::None {
            return Ok(());
        }
        let key = CleanupKey::new(namespace, name, action)?;
        self.record(&key);
        self.queue.add_after(key.encode(), delay.min(MAX_DELAY));
        Ok(())
    }

    /// Start graceful termination of a pod's containers.
    pub fn terminate_containers(&self, namespace: &str, name: &str) -> Result<()> {
        self.queue_pod_for_cleanup(namespace, name, CleanupAction::TerminateContainers)
    }

    /// Delete a pod.
    pub fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.queue_pod_for_cleanup(namespace, name, CleanupAction::DeletePod)
    }

    /// Resolve the cleanup action for `pod` and enqueue it.
    ///
    /// Deletes wait for `delay`; other actions go through the rate limiter.
    /// Returns the resolved action.
    pub fn enact_any_pod_cleanup(
        &self,
        selector: &Selector,
        pod: &Pod,
        strategy: PodGcStrategy,
        workflow_phase: WorkflowPhase,
        delay: Duration,
    ) -> CleanupAction {
        let action = resolve(
            selector,
            &pod.labels,
            strategy,
            workflow_phase,
            pod.phase,
            &pod.finalizers,
        );
        info!(pod = %pod.key(), action = %action, "Pod cleanup action resolved");

        let queued = match action {
            CleanupAction::DeletePod => {
                self.queue_pod_for_cleanup_after(&pod.namespace, &pod.name, action, delay)
            }
            _ => self.queue_pod_for_cleanup(&pod.namespace, &pod.name, action),
        };
        if let Err(e) = queued {
            error!(pod = %pod.key(), error = %e, "Failed to queue pod for cleanup");
        }
        action
    }

    /// Resolve and enqueue cleanup for every pod of a workflow whose node is fulfilled.
    ///
    /// Returns how many pods got an action.
    pub fn queue_workflow_pods(&self, workflow: &WorkflowGcContext) -> usize {
        let mut delay = self.config.delete_delay;
        match workflow.pod_gc.delete_delay() {
            Ok(Some(d)) => delay = d.min(MAX_DELAY),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    workflow = %workflow.name,
                    error = %e,
                    "Failed to parse podGC.deleteDelayDuration"
                );
            }
        }

        let strategy = workflow.pod_gc.strategy();
        let selector = workflow.pod_gc.selector().unwrap_or_else(|e| {
            warn!(
                workflow = %workflow.name,
                error = %e,
                "Invalid podGC.labelSelector, no pod will be deleted"
            );
            Selector::nothing()
        });

        let mut queued = 0;
        for pod in self.cache.pods_for_workflow(&workflow.namespace, &workflow.name) {
            // agent and other auxiliary pods are never collected
            if pod.labels.contains_key(LABEL_COMPONENT) {
                continue;
            }
            let node_phase = pod
                .node_id()
                .and_then(|node_id| workflow.node_phases.get(node_id));
            let Some(node_phase) = node_phase else {
                error!(
                    pod = %pod.key(),
                    node_id = pod.node_id().unwrap_or_default(),
                    "Unable to obtain node for pod"
                );
                continue;
            };
            if !node_phase.fulfilled() {
                continue;
            }
            let action =
                self.enact_any_pod_cleanup(&selector, &pod, strategy, workflow.phase, delay);
            if action != CleanupAction::None {
                queued += 1;
            }
        }
        queued
    }

    /// Signal the running containers of a cached pod.
    ///
    /// Returns the pod's termination grace period, or `None` when the pod is
    /// not cached.
    pub async fn signal_containers(
        &self,
        namespace: &str,
        name: &str,
        signal: Signal,
    ) -> Option<Duration> {
        let pod = self.cache.get(namespace, name)?;
        let report = signal_running_containers(self.signaller.as_ref(), &pod, signal).await;
        debug!(
            pod = %pod.key(),
            signal = signal.as_str(),
            signalled = report.signalled,
            failed = report.failed,
            "Signalled pod containers"
        );
        Some(pod.termination_grace_period())
    }

    /// Run one worker until the queue shuts down.
    pub async fn run_worker(&self, worker: usize) {
        debug!(worker, "Pod cleanup worker started");
        while self.process_next_item().await {}
        debug!(worker, "Pod cleanup worker stopped");
    }

    /// Pop and process one key. Returns `false` once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(token) = self.queue.get().await else {
            return false;
        };
        self.process_token(token).await;
        true
    }

    fn latest(&self) -> MutexGuard<'_, HashMap<String, CleanupAction>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, key: &CleanupKey) {
        if key.action().is_final() {
            self.latest()
                .insert(pod_key(key.namespace(), key.name()), key.action());
        }
    }

    /// A newer final action was enqueued for the same pod.
    fn superseded(&self, key: &CleanupKey) -> bool {
        key.action().is_final()
            && self
                .latest()
                .get(&pod_key(key.namespace(), key.name()))
                .is_some_and(|latest| *latest != key.action())
    }

    /// Forget the pod's latest action once none of its final actions is pending.
    fn settle(&self, key: &CleanupKey) {
        if !key.action().is_final() {
            return;
        }
        let mut latest = self.latest();
        let pending = CleanupAction::FINAL.iter().any(|action| {
            self.queue
                .is_pending(&key::encode(key.namespace(), key.name(), *action))
        });
        if !pending {
            latest.remove(&pod_key(key.namespace(), key.name()));
        }
    }

    async fn process_token(&self, token: String) {
        let Some(key) = key::decode(&token) else {
            error!(key = %token, "Malformed pod cleanup key, dropping");
            self.queue.forget(&token);
            self.queue.done(&token);
            return;
        };

        if self.superseded(&key) {
            info!(key = %token, "Pod cleanup action superseded, dropping");
            self.queue.forget(&token);
            self.queue.done(&token);
            self.settle(&key);
            return;
        }

        info!(key = %token, action = %key.action(), "Cleaning up pod");
        match self.execute(&key).await {
            Ok(()) => self.queue.forget(&token),
            Err(e) if e.is_transient() => {
                warn!(
                    key = %token,
                    error = %e,
                    retries = self.queue.num_requeues(&token),
                    "Failed to clean up pod, will retry"
                );
                self.queue.add_rate_limited(token.clone());
            }
            Err(e) => {
                warn!(key = %token, error = %e, "Failed to clean up pod");
                self.queue.forget(&token);
            }
        }
        self.queue.done(&token);
        self.settle(&key);
    }

    async fn execute(&self, key: &CleanupKey) -> Result<()> {
        let (namespace, name) = (key.namespace(), key.name());
        match key.action() {
            CleanupAction::TerminateContainers => {
                if let Some(pod) = self.cache.get(namespace, name)
                    && pod.phase == PodPhase::Pending
                {
                    debug!(pod = %pod.key(), "Pod never started, deleting instead");
                    return self.queue_pod_for_cleanup(namespace, name, CleanupAction::DeletePod);
                }
                match self.signal_containers(namespace, name, Signal::SIGTERM).await {
                    Some(grace) if !grace.is_zero() => self.queue_pod_for_cleanup_after(
                        namespace,
                        name,
                        CleanupAction::KillContainers,
                        grace.min(MAX_DELAY),
                    ),
                    Some(_) => Ok(()),
                    None => {
                        debug!(key = %key, "Pod gone before termination");
                        Ok(())
                    }
                }
            }
            CleanupAction::KillContainers => {
                self.signal_containers(namespace, name, Signal::SIGKILL).await;
                Ok(())
            }
            CleanupAction::LabelPodCompleted => {
                self.patch_for_cleanup(namespace, name, true, self.config.capture_finalizer)
                    .await
            }
            CleanupAction::DeletePod => {
                self.patch_for_cleanup(namespace, name, true, self.config.capture_finalizer)
                    .await?;
                let options = DeleteOptions {
                    propagation: PropagationPolicy::Background,
                    grace_period_seconds: self.config.grace_period_seconds,
                };
                match self.client.delete(namespace, name, &options).await {
                    Err(e) if !e.is_not_found() => Err(e.into()),
                    _ => Ok(()),
                }
            }
            CleanupAction::RemoveFinalizer => {
                self.patch_for_cleanup(namespace, name, false, true).await
            }
            CleanupAction::None => Ok(()),
        }
    }

    async fn patch_for_cleanup(
        &self,
        namespace: &str,
        name: &str,
        label_completed: bool,
        remove_finalizer: bool,
    ) -> Result<()> {
        // not cached: already deleted, or already labelled completed
        let Some(pod) = self.cache.get(namespace, name) else {
            return Ok(());
        };
        let Some(patch) = cleanup_patch(&pod, label_completed, remove_finalizer) else {
            debug!(pod = %pod.key(), "Nothing to patch");
            return Ok(());
        };
        match self.client.patch(namespace, name, &patch).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }
}
