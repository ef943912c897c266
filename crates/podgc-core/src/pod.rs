// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cached pod snapshot and the labels the controller reads and writes.
//!
//! [`Pod`] is a deliberately small projection of the Kubernetes Pod object:
//! only the fields that participate in garbage-collection decisions are kept.
//! Adapters (see `podgc-controller`) convert API objects into this shape.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label present on every pod created for a workflow; its value is the workflow name.
pub const LABEL_WORKFLOW: &str = "workflows.argoproj.io/workflow";

/// Label marking a pod as fully processed by the controller.
pub const LABEL_COMPLETED: &str = "workflows.argoproj.io/completed";

/// Label scoping a pod to a controller instance.
pub const LABEL_CONTROLLER_INSTANCE_ID: &str = "workflows.argoproj.io/controller-instanceid";

/// Label carrying the workflow node ID that a pod executes.
pub const LABEL_NODE_ID: &str = "workflows.argoproj.io/node-id";

/// Label present on auxiliary pods (e.g. agents) that must never be garbage collected.
pub const LABEL_COMPONENT: &str = "workflows.argoproj.io/component";

/// Finalizer added to pods so their status can be captured before they disappear.
pub const FINALIZER_POD_STATUS: &str = "workflows.argoproj.io/status";

/// Annotation prefix for per-container kill command overrides.
pub const ANNOTATION_KILL_CMD_PREFIX: &str = "workflows.argoproj.io/kill-cmd-";

/// Grace period applied when a pod does not specify `terminationGracePeriodSeconds`.
pub const DEFAULT_TERMINATION_GRACE_PERIOD_SECS: i64 = 30;

/// Kubernetes pod phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but no container has started yet.
    Pending,
    /// Bound to a node and at least one container is running.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// All containers terminated and at least one failed.
    Failed,
    /// State could not be obtained.
    #[default]
    Unknown,
}

impl PodPhase {
    /// The phase as it appears in the pod status.
    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }

    /// Parse a phase string; anything unrecognised maps to [`PodPhase::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of a single container.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContainerState {
    /// Not yet running (image pull, crash loop back-off, ...).
    Waiting {
        /// Machine-readable reason, if reported.
        reason: Option<String>,
    },
    /// Running since `started_at`.
    Running {
        /// Time the container started.
        started_at: Option<DateTime<Utc>>,
    },
    /// Finished.
    Terminated {
        /// Process exit code.
        exit_code: i32,
        /// Machine-readable reason, if reported.
        reason: Option<String>,
    },
    /// No state reported yet.
    #[default]
    Unknown,
}

/// Status of one container within a pod.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// Whether the readiness probe succeeded.
    pub ready: bool,
    /// Current state.
    pub state: ContainerState,
}

impl ContainerStatus {
    /// True when the container has a running process that can receive signals.
    pub fn is_running(&self) -> bool {
        matches!(self.state, ContainerState::Running { .. })
    }
}

/// Local, possibly stale, snapshot of a pod.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pod {
    /// Namespace the pod lives in.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Server-assigned version used for optimistic concurrency.
    pub resource_version: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Finalizers blocking deletion.
    pub finalizers: Vec<String>,
    /// Set once deletion has been requested.
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Node the pod is bound to.
    pub node_name: Option<String>,
    /// `spec.terminationGracePeriodSeconds`.
    pub termination_grace_period_seconds: Option<i64>,
    /// `status.phase`.
    pub phase: PodPhase,
    /// `status.message`.
    pub message: Option<String>,
    /// `status.podIP`.
    pub pod_ip: Option<String>,
    /// `status.containerStatuses`.
    pub container_statuses: Vec<ContainerStatus>,
}

impl Pod {
    /// Create a pod with the given namespace and name and everything else defaulted.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// The `{namespace}/{name}` cache key.
    pub fn key(&self) -> String {
        pod_key(&self.namespace, &self.name)
    }

    /// The name of the workflow that owns this pod, if labelled.
    pub fn workflow_name(&self) -> Option<&str> {
        self.labels.get(LABEL_WORKFLOW).map(String::as_str)
    }

    /// The workflow node this pod executes, if labelled.
    pub fn node_id(&self) -> Option<&str> {
        self.labels.get(LABEL_NODE_ID).map(String::as_str)
    }

    /// Whether the pod carries the status-capture finalizer.
    pub fn has_status_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == FINALIZER_POD_STATUS)
    }

    /// Whether the pod is already labelled `completed=true`.
    pub fn is_labelled_completed(&self) -> bool {
        self.labels.get(LABEL_COMPLETED).is_some_and(|v| v == "true")
    }

    /// Grace period between SIGTERM and SIGKILL for this pod.
    pub fn termination_grace_period(&self) -> std::time::Duration {
        let secs = self
            .termination_grace_period_seconds
            .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD_SECS)
            .max(0);
        std::time::Duration::from_secs(secs as u64)
    }

    /// Containers with a running process.
    pub fn running_containers(&self) -> impl Iterator<Item = &ContainerStatus> {
        self.container_statuses.iter().filter(|c| c.is_running())
    }

    /// Builder-style label setter, mostly for tests and adapters.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Builder-style phase setter.
    pub fn with_phase(mut self, phase: PodPhase) -> Self {
        self.phase = phase;
        self
    }
}

/// Build the `{namespace}/{name}` key used by the pod cache.
pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}
