// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the pod GC engine.
//!
//! [`PodGcRuntime`] wires a [`PodSource`], a [`PodClient`] and a
//! [`ContainerSignaller`] into a running controller: the pod cache is synced
//! from an initial listing, a watch task keeps it current, and a pool of
//! workers drains the cleanup queue.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use podgc_core::runtime::PodGcRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cluster = Arc::new(MyCluster::connect().await?);
//!
//!     let runtime = PodGcRuntime::builder()
//!         .source(cluster.clone())
//!         .client(cluster.clone())
//!         .signaller(cluster)
//!         .handler(Arc::new(MyReconciler))
//!         .namespace("argo")
//!         .workers(8)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // reconcilers enqueue work through runtime.controller()
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::{PodCache, PodEventHandler};
use crate::client::{PodClient, PodSource};
use crate::controller::{ControllerConfig, PodGcController};
use crate::selector::workflow_pod_selector;
use crate::signal::ContainerSignaller;
use crate::watch::PodWatcher;

/// Builder for creating a [`PodGcRuntime`].
#[derive(Default)]
pub struct PodGcRuntimeBuilder {
    source: Option<Arc<dyn PodSource>>,
    client: Option<Arc<dyn PodClient>>,
    signaller: Option<Arc<dyn ContainerSignaller>>,
    handler: Option<Arc<dyn PodEventHandler>>,
    config: ControllerConfig,
}

impl PodGcRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pod list/watch source (required).
    pub fn source(mut self, source: Arc<dyn PodSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the pod patch/delete client (required).
    pub fn client(mut self, client: Arc<dyn PodClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the container signaller (required).
    pub fn signaller(mut self, signaller: Arc<dyn ContainerSignaller>) -> Self {
        self.signaller = Some(signaller);
        self
    }

    /// Set the callback notified of significant pod changes.
    pub fn handler(mut self, handler: Arc<dyn PodEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Replace the whole controller configuration.
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Namespace to watch.
    ///
    /// Default: all namespaces
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Controller instance ID.
    ///
    /// Default: none (pods without an instance label)
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.config.instance_id = instance_id.into();
        self
    }

    /// Number of cleanup workers.
    ///
    /// Default: 4
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Default delay before deleting a pod.
    ///
    /// Default: 5 seconds
    pub fn delete_delay(mut self, delay: Duration) -> Self {
        self.config.delete_delay = delay;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<PodGcRuntimeConfig> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("source is required"))?;
        let client = self
            .client
            .ok_or_else(|| anyhow::anyhow!("client is required"))?;
        let signaller = self
            .signaller
            .ok_or_else(|| anyhow::anyhow!("signaller is required"))?;
        if self.config.workers == 0 {
            anyhow::bail!("at least one worker is required");
        }

        Ok(PodGcRuntimeConfig {
            source,
            client,
            signaller,
            handler: self.handler,
            config: self.config,
        })
    }
}

/// Configuration for a [`PodGcRuntime`].
pub struct PodGcRuntimeConfig {
    source: Arc<dyn PodSource>,
    client: Arc<dyn PodClient>,
    signaller: Arc<dyn ContainerSignaller>,
    handler: Option<Arc<dyn PodEventHandler>>,
    config: ControllerConfig,
}

impl PodGcRuntimeConfig {
    /// Sync the pod cache, then spawn the watch task and the workers.
    pub async fn start(self) -> Result<PodGcRuntime> {
        let cache = Arc::new(match self.handler {
            Some(handler) => PodCache::with_handler(handler),
            None => PodCache::new(),
        });

        let watcher = PodWatcher::new(
            self.source,
            cache.clone(),
            self.config.namespace.clone(),
            workflow_pod_selector(&self.config.instance_id),
        );
        let stream = watcher.open();
        watcher.sync().await?;

        let watch_shutdown = watcher.shutdown_handle();
        let watch_handle = tokio::spawn(async move {
            watcher.run(stream).await;
        });

        let workers = self.config.workers;
        let controller = Arc::new(PodGcController::new(
            cache,
            self.client,
            self.signaller,
            self.config,
        ));
        let worker_handles = (0..workers)
            .map(|worker| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    controller.run_worker(worker).await;
                })
            })
            .collect();

        info!(
            namespace = %controller.config().namespace,
            instance_id = %controller.config().instance_id,
            workers,
            "PodGcRuntime started"
        );

        Ok(PodGcRuntime {
            controller,
            watch_handle,
            watch_shutdown,
            worker_handles,
        })
    }
}

/// A running pod GC engine.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct PodGcRuntime {
    controller: Arc<PodGcController>,
    watch_handle: JoinHandle<()>,
    watch_shutdown: Arc<Notify>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl PodGcRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> PodGcRuntimeBuilder {
        PodGcRuntimeBuilder::new()
    }

    /// The controller, for enqueueing cleanup work.
    pub fn controller(&self) -> &Arc<PodGcController> {
        &self.controller
    }

    /// The pod cache.
    pub fn cache(&self) -> &Arc<PodCache> {
        self.controller.cache()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the watch, releases idle workers and waits for in-flight items
    /// to finish. Items still waiting on a delay are dropped.
    pub async fn shutdown(self) -> Result<()> {
        info!("PodGcRuntime shutting down...");

        self.watch_shutdown.notify_one();
        self.controller.queue().shutdown();

        if let Err(e) = self.watch_handle.await {
            error!("Pod watch task panicked: {}", e);
        }
        for handle in self.worker_handles {
            if let Err(e) = handle.await {
                error!("Pod cleanup worker panicked: {}", e);
            }
        }

        info!("PodGcRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    #[test]
    fn test_build_requires_collaborators() {
        let err = PodGcRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("source"));

        let cluster = Arc::new(MockCluster::new());
        let err = PodGcRuntime::builder()
            .source(cluster.clone())
            .client(cluster.clone())
            .signaller(cluster)
            .workers(0)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("worker"));
    }
}
