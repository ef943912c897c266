// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Standalone host for the pod GC engine.
//!
//! Watches workflow pods, keeps the local cache current and runs the cleanup
//! worker pool. Pod changes are only logged here: cleanup work is enqueued by
//! a workflow reconciler embedding [`PodGcRuntime`] and calling
//! `runtime.controller().queue_workflow_pods(..)`, so on its own this binary
//! does not collect pods.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use podgc_controller::KubeCluster;
use podgc_core::cache::PodEventHandler;
use podgc_core::config::Config;
use podgc_core::pod::Pod;
use podgc_core::runtime::PodGcRuntime;

/// Logs every significant pod change.
struct LoggingHandler;

#[async_trait]
impl PodEventHandler for LoggingHandler {
    async fn on_pod_event(&self, pod: &Pod) -> anyhow::Result<()> {
        debug!(
            pod = %pod.key(),
            workflow = pod.workflow_name().unwrap_or_default(),
            phase = pod.phase.as_str(),
            "Pod changed"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podgc_controller=info,podgc_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        namespace = %config.namespace,
        instance_id = %config.instance_id,
        workers = config.workers,
        delete_delay = ?config.delete_delay,
        "Starting pod GC controller"
    );

    let cluster = Arc::new(KubeCluster::try_default().await?);
    info!("Connected to Kubernetes API");

    let runtime = PodGcRuntime::builder()
        .source(cluster.clone())
        .client(cluster.clone())
        .signaller(cluster)
        .handler(Arc::new(LoggingHandler))
        .config(config.controller_config())
        .build()?
        .start()
        .await?;

    info!(pods = runtime.cache().len(), "Pod GC controller ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Pod GC controller shut down");

    Ok(())
}
