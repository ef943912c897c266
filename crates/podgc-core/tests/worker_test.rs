// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the cleanup workers - signalling, patching, deleting and retries.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use nix::sys::signal::Signal;
use podgc_core::action::{NodePhase, PodGc, PodGcStrategy, WorkflowPhase};
use podgc_core::client::{ApiError, PropagationPolicy};
use podgc_core::controller::{ControllerConfig, WorkflowGcContext};
use podgc_core::mock::MockCluster;
use podgc_core::pod::{FINALIZER_POD_STATUS, LABEL_COMPLETED, PodPhase};
use podgc_core::queue::{QueueMetrics, RateLimiterConfig};
use podgc_core::{CleanupAction, PodClient};
use serde_json::json;

use common::{controller, init_tracing, running, workflow_pod};

#[tokio::test(start_paused = true)]
async fn test_terminate_pending_pod_deletes_without_signalling() {
    init_tracing();
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("pending", PodPhase::Pending));
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller.terminate_containers("argo", "pending").unwrap();
    assert!(controller.process_next_item().await);
    assert!(cluster.signals().is_empty());
    assert!(cluster.deletes().is_empty());

    // the follow-up delete
    assert!(controller.process_next_item().await);
    let deletes = cluster.deletes();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].pod, "argo/pending");
    assert_eq!(deletes[0].options.propagation, PropagationPolicy::Background);
    assert!(cluster.pod("argo", "pending").is_none());
    assert!(cluster.signals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_terminate_defaults_to_thirty_second_grace_period() {
    init_tracing();
    let cluster = Arc::new(MockCluster::new());
    let mut pod = workflow_pod("busy", PodPhase::Running);
    pod.container_statuses = vec![running("wait"), running("main")];
    cluster.apply_pod(pod);
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller.terminate_containers("argo", "busy").unwrap();
    assert!(controller.process_next_item().await);

    let signals: Vec<Signal> = cluster.signals().iter().map(|s| s.signal).collect();
    assert_eq!(signals, vec![Signal::SIGTERM, Signal::SIGTERM]);
    assert_eq!(controller.queue_metrics().waiting, 1);

    tokio::time::advance(Duration::from_secs(29)).await;
    assert_eq!(controller.queue().get().now_or_never(), None);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(controller.process_next_item().await);
    let kills = cluster
        .signals()
        .iter()
        .filter(|s| s.signal == Signal::SIGKILL)
        .count();
    assert_eq!(kills, 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_grace_period_skips_kill() {
    let cluster = Arc::new(MockCluster::new());
    let mut pod = workflow_pod("quick", PodPhase::Running);
    pod.container_statuses = vec![running("main")];
    pod.termination_grace_period_seconds = Some(0);
    cluster.apply_pod(pod);
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller.terminate_containers("argo", "quick").unwrap();
    assert!(controller.process_next_item().await);

    assert_eq!(cluster.signals().len(), 1);
    assert_eq!(controller.queue_metrics(), QueueMetrics::default());
}

#[tokio::test(start_paused = true)]
async fn test_signal_failure_does_not_stop_other_containers() {
    let cluster = Arc::new(MockCluster::new());
    cluster.fail_signals_to("wait");
    let mut pod = workflow_pod("busy", PodPhase::Running);
    pod.container_statuses = vec![running("wait"), running("main")];
    cluster.apply_pod(pod);
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller.terminate_containers("argo", "busy").unwrap();
    assert!(controller.process_next_item().await);

    let containers: Vec<String> = cluster.signals().into_iter().map(|s| s.container).collect();
    assert_eq!(containers, vec!["wait", "main"]);
    // kill is still scheduled
    assert_eq!(controller.queue_metrics().waiting, 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminate_and_kill_of_uncached_pod_do_nothing() {
    let cluster = Arc::new(MockCluster::new());
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller.terminate_containers("argo", "ghost").unwrap();
    assert!(controller.process_next_item().await);
    controller
        .queue_pod_for_cleanup("argo", "ghost", CleanupAction::KillContainers)
        .unwrap();
    assert!(controller.process_next_item().await);

    assert!(cluster.signals().is_empty());
    assert!(cluster.deletes().is_empty());
    assert_eq!(cluster.api_calls(), 0);
    assert_eq!(controller.queue_metrics(), QueueMetrics::default());
}

#[tokio::test(start_paused = true)]
async fn test_huge_grace_period_schedules_kill_without_overflow() {
    let cluster = Arc::new(MockCluster::new());
    let mut pod = workflow_pod("stubborn", PodPhase::Running);
    pod.container_statuses = vec![running("main")];
    pod.termination_grace_period_seconds = Some(i64::MAX);
    cluster.apply_pod(pod);
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller.terminate_containers("argo", "stubborn").unwrap();
    assert!(controller.process_next_item().await);

    assert_eq!(cluster.signals().len(), 1);
    assert_eq!(controller.queue_metrics().waiting, 1);
    assert_eq!(controller.queue().get().now_or_never(), None);
}

#[tokio::test(start_paused = true)]
async fn test_huge_delete_delay_is_clamped() {
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("done", PodPhase::Succeeded));
    let controller = controller(&cluster, ControllerConfig::default()).await;
    let workflow = WorkflowGcContext {
        namespace: "argo".into(),
        name: "wf".into(),
        phase: WorkflowPhase::Running,
        pod_gc: PodGc {
            strategy: Some(PodGcStrategy::OnPodCompletion),
            delete_delay_duration: Some("580000000000y".into()),
            ..Default::default()
        },
        node_phases: HashMap::from([("wf-done".to_string(), NodePhase::Succeeded)]),
    };

    assert_eq!(controller.queue_workflow_pods(&workflow), 1);
    assert_eq!(controller.queue_metrics().waiting, 1);
    assert!(cluster.deletes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_zero_qps_does_not_panic() {
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("done", PodPhase::Succeeded));
    cluster.fail_next_delete(ApiError::from_status(503, "unavailable"));
    let config = ControllerConfig {
        rate_limiter: RateLimiterConfig {
            qps: 0.0,
            burst: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let controller = controller(&cluster, config).await;

    controller.delete_pod("argo", "done").unwrap();
    assert!(controller.process_next_item().await);

    assert_eq!(cluster.deletes().len(), 1);
    assert_eq!(controller.queue_metrics().waiting, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_delete_is_dropped_after_newer_label() {
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("keep", PodPhase::Failed));
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller
        .queue_pod_for_cleanup_after(
            "argo",
            "keep",
            CleanupAction::DeletePod,
            Duration::from_secs(5),
        )
        .unwrap();
    controller
        .queue_pod_for_cleanup("argo", "keep", CleanupAction::LabelPodCompleted)
        .unwrap();

    assert!(controller.process_next_item().await);
    assert_eq!(cluster.pod("argo", "keep").unwrap().labels[LABEL_COMPLETED], "true");
    // the labelled pod leaves the watched set
    common::resync(&cluster, &controller).await;
    assert!(controller.cache().get("argo", "keep").is_none());

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(controller.process_next_item().await);
    assert!(cluster.deletes().is_empty());
    assert!(cluster.pod("argo", "keep").is_some());
    assert_eq!(controller.queue_metrics(), QueueMetrics::default());

    // once settled, a fresh delete request goes through
    controller.delete_pod("argo", "keep").unwrap();
    assert!(controller.process_next_item().await);
    assert_eq!(cluster.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_label_is_dropped_after_newer_delete() {
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("done", PodPhase::Succeeded));
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller
        .queue_pod_for_cleanup("argo", "done", CleanupAction::LabelPodCompleted)
        .unwrap();
    controller.delete_pod("argo", "done").unwrap();

    assert!(controller.process_next_item().await);
    assert!(controller.process_next_item().await);
    // only the delete's own label patch, never a separate label run
    assert_eq!(cluster.patches().len(), 1);
    assert_eq!(cluster.deletes().len(), 1);
    assert!(cluster.pod("argo", "done").is_none());
}

#[tokio::test]
async fn test_delete_of_missing_pod_is_idempotent() {
    let cluster = Arc::new(MockCluster::new());
    let options = Default::default();
    assert!(cluster.delete("argo", "gone", &options).await.unwrap_err().is_not_found());
    assert!(cluster.delete("argo", "gone", &options).await.unwrap_err().is_not_found());

    let controller = controller(&cluster, ControllerConfig::default()).await;
    for _ in 0..2 {
        controller.delete_pod("argo", "gone").unwrap();
        assert!(controller.process_next_item().await);
        assert_eq!(controller.queue_metrics(), QueueMetrics::default());
        assert_eq!(controller.queue().num_requeues(&"argo/gone/deletePod".to_string()), 0);
    }
    assert_eq!(cluster.deletes().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_delete_labels_before_deleting() {
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("done", PodPhase::Succeeded));
    let config = ControllerConfig {
        grace_period_seconds: Some(10),
        ..Default::default()
    };
    let controller = controller(&cluster, config).await;

    controller.delete_pod("argo", "done").unwrap();
    assert!(controller.process_next_item().await);

    let patches = cluster.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0].patch,
        json!({"metadata": {"labels": {LABEL_COMPLETED: "true"}}})
    );
    assert_eq!(cluster.deletes()[0].options.grace_period_seconds, Some(10));
    assert!(cluster.pod("argo", "done").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried_then_forgotten() {
    init_tracing();
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("done", PodPhase::Succeeded));
    cluster.fail_next_delete(ApiError::from_status(503, "etcdserver: leader changed"));
    let controller = controller(&cluster, ControllerConfig::default()).await;
    let key = "argo/done/deletePod".to_string();

    controller.delete_pod("argo", "done").unwrap();
    assert!(controller.process_next_item().await);
    assert!(cluster.pod("argo", "done").is_some());
    assert_eq!(controller.queue_metrics().waiting, 1);
    let retries = controller.queue().num_requeues(&key);
    assert!(retries >= 2, "expected backoff history, got {retries}");

    assert!(controller.process_next_item().await);
    assert_eq!(cluster.deletes().len(), 2);
    assert!(cluster.pod("argo", "done").is_none());
    assert_eq!(controller.queue().num_requeues(&key), 0);
    assert_eq!(controller.queue_metrics(), QueueMetrics::default());
}

#[tokio::test(start_paused = true)]
async fn test_conflict_is_retried() {
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("done", PodPhase::Succeeded));
    cluster.fail_next_patch(ApiError::Conflict("the object has been modified".into()));
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller
        .queue_pod_for_cleanup("argo", "done", CleanupAction::LabelPodCompleted)
        .unwrap();
    assert!(controller.process_next_item().await);
    assert!(controller.process_next_item().await);

    assert_eq!(cluster.patches().len(), 2);
    assert_eq!(cluster.pod("argo", "done").unwrap().labels[LABEL_COMPLETED], "true");
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_dropped() {
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("done", PodPhase::Succeeded));
    cluster.fail_next_patch(ApiError::from_status(403, "forbidden"));
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller
        .queue_pod_for_cleanup("argo", "done", CleanupAction::LabelPodCompleted)
        .unwrap();
    assert!(controller.process_next_item().await);

    assert_eq!(controller.queue_metrics(), QueueMetrics::default());
    assert_eq!(
        controller
            .queue()
            .num_requeues(&"argo/done/labelPodCompleted".to_string()),
        0
    );
    assert_eq!(cluster.pod("argo", "done").unwrap().labels[LABEL_COMPLETED], "false");
}

#[tokio::test(start_paused = true)]
async fn test_label_removes_finalizer_when_capture_enabled() {
    let cluster = Arc::new(MockCluster::new());
    let mut pod = workflow_pod("done", PodPhase::Failed);
    pod.finalizers = vec![FINALIZER_POD_STATUS.to_string()];
    cluster.apply_pod(pod);
    let config = ControllerConfig {
        capture_finalizer: true,
        ..Default::default()
    };
    let controller = controller(&cluster, config).await;

    controller
        .queue_pod_for_cleanup("argo", "done", CleanupAction::LabelPodCompleted)
        .unwrap();
    assert!(controller.process_next_item().await);

    assert_eq!(cluster.patches().len(), 1);
    let pod = cluster.pod("argo", "done").unwrap();
    assert_eq!(pod.labels[LABEL_COMPLETED], "true");
    assert!(pod.finalizers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_label_keeps_finalizer_when_capture_disabled() {
    let cluster = Arc::new(MockCluster::new());
    let mut pod = workflow_pod("done", PodPhase::Failed);
    pod.finalizers = vec![FINALIZER_POD_STATUS.to_string()];
    cluster.apply_pod(pod);
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller
        .queue_pod_for_cleanup("argo", "done", CleanupAction::LabelPodCompleted)
        .unwrap();
    assert!(controller.process_next_item().await);

    let pod = cluster.pod("argo", "done").unwrap();
    assert_eq!(pod.finalizers, vec![FINALIZER_POD_STATUS.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_remove_finalizer_with_nothing_to_remove_makes_no_calls() {
    let cluster = Arc::new(MockCluster::new());
    cluster.apply_pod(workflow_pod("running", PodPhase::Running));
    let controller = controller(&cluster, ControllerConfig::default()).await;

    controller
        .queue_pod_for_cleanup("argo", "running", CleanupAction::RemoveFinalizer)
        .unwrap();
    assert!(controller.process_next_item().await);

    assert_eq!(cluster.api_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remove_finalizer_only_touches_finalizers() {
    let cluster = Arc::new(MockCluster::new());
    let mut pod = workflow_pod("running", PodPhase::Running);
    pod.finalizers = vec!["other/keep".to_string(), FINALIZER_POD_STATUS.to_string()];
    cluster.apply_pod(pod);
    let controller = controller(&cluster, ControllerConfig::default()).await;
    let version = cluster.pod("argo", "running").unwrap().resource_version;

    controller
        .queue_pod_for_cleanup("argo", "running", CleanupAction::RemoveFinalizer)
        .unwrap();
    assert!(controller.process_next_item().await);

    assert_eq!(
        cluster.patches()[0].patch,
        json!({"metadata": {"finalizers": ["other/keep"], "resourceVersion": version}})
    );
    let pod = cluster.pod("argo", "running").unwrap();
    assert_eq!(pod.labels[LABEL_COMPLETED], "false");
    assert_eq!(pod.finalizers, vec!["other/keep".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_workers() {
    let cluster = Arc::new(MockCluster::new());
    let controller = Arc::new(controller(&cluster, ControllerConfig::default()).await);

    let worker = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run_worker(0).await })
    };
    tokio::task::yield_now().await;

    controller.queue().shutdown();
    worker.await.unwrap();
    assert!(!controller.process_next_item().await);
}
