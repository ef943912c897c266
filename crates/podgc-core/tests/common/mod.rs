// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for podgc-core integration tests.
//!
//! Provides pod fixtures and a controller wired to a [`MockCluster`].

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use podgc_core::cache::{PodCache, PodEventHandler};
use podgc_core::controller::{ControllerConfig, PodGcController};
use podgc_core::mock::MockCluster;
use podgc_core::pod::{
    ContainerState, ContainerStatus, LABEL_COMPLETED, LABEL_NODE_ID, LABEL_WORKFLOW, Pod,
    PodPhase,
};
use podgc_core::selector::workflow_pod_selector;
use podgc_core::PodSource;

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A pod of workflow `wf` that the cache would mirror.
pub fn workflow_pod(name: &str, phase: PodPhase) -> Pod {
    Pod::new("argo", name)
        .with_label(LABEL_WORKFLOW, "wf")
        .with_label(LABEL_COMPLETED, "false")
        .with_label(LABEL_NODE_ID, format!("wf-{name}"))
        .with_phase(phase)
}

/// A container status in the running state.
pub fn running(name: &str) -> ContainerStatus {
    ContainerStatus {
        name: name.to_string(),
        ready: true,
        state: ContainerState::Running { started_at: None },
    }
}

/// Controller over `cluster` with its cache synced from the current pods.
pub async fn controller(cluster: &Arc<MockCluster>, config: ControllerConfig) -> PodGcController {
    let cache = Arc::new(PodCache::new());
    let controller = PodGcController::new(cache, cluster.clone(), cluster.clone(), config);
    resync(cluster, &controller).await;
    controller
}

/// Reload the controller's cache from the cluster.
pub async fn resync(cluster: &Arc<MockCluster>, controller: &PodGcController) {
    let pods = cluster
        .list("", &workflow_pod_selector(""))
        .await
        .expect("mock list");
    controller.cache().replace(pods).await;
}

/// Handler recording the name of every pod it is notified about.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<(String, PodPhase)>>,
}

impl RecordingHandler {
    /// Notifications so far as `(name, phase)`.
    pub fn seen(&self) -> Vec<(String, PodPhase)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodEventHandler for RecordingHandler {
    async fn on_pod_event(&self, pod: &Pod) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((pod.name.clone(), pod.phase));
        Ok(())
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
