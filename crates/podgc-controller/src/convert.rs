// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conversion from Kubernetes API pods to engine pods.

use k8s_openapi::api::core::v1 as corev1;
use podgc_core::pod::{ContainerState, ContainerStatus, Pod, PodPhase};

/// Project an API pod onto the fields the engine uses.
pub fn pod_from_k8s(pod: &corev1::Pod) -> Pod {
    let meta = &pod.metadata;
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    Pod {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        finalizers: meta.finalizers.clone().unwrap_or_default(),
        deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0),
        node_name: spec.and_then(|s| s.node_name.clone()),
        termination_grace_period_seconds: spec.and_then(|s| s.termination_grace_period_seconds),
        phase: status
            .and_then(|s| s.phase.as_deref())
            .map(PodPhase::parse)
            .unwrap_or_default(),
        message: status.and_then(|s| s.message.clone()),
        pod_ip: status.and_then(|s| s.pod_ip.clone()),
        container_statuses: status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| statuses.iter().map(container_status).collect())
            .unwrap_or_default(),
    }
}

fn container_status(status: &corev1::ContainerStatus) -> ContainerStatus {
    ContainerStatus {
        name: status.name.clone(),
        ready: status.ready,
        state: status
            .state
            .as_ref()
            .map(container_state)
            .unwrap_or_default(),
    }
}

fn container_state(state: &corev1::ContainerState) -> ContainerState {
    if let Some(running) = &state.running {
        return ContainerState::Running {
            started_at: running.started_at.as_ref().map(|t| t.0),
        };
    }
    if let Some(terminated) = &state.terminated {
        return ContainerState::Terminated {
            exit_code: terminated.exit_code,
            reason: terminated.reason.clone(),
        };
    }
    if let Some(waiting) = &state.waiting {
        return ContainerState::Waiting {
            reason: waiting.reason.clone(),
        };
    }
    ContainerState::Unknown
}
