// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background task feeding the pod cache from a watch stream.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cache::PodCache;
use crate::client::{ApiError, PodSource, SourceEvent};
use crate::selector::Selector;

/// Pause before reopening a watch stream that ended.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Applies watch events to a [`PodCache`] until shut down.
pub struct PodWatcher {
    source: Arc<dyn PodSource>,
    cache: Arc<PodCache>,
    namespace: String,
    selector: Selector,
    shutdown: Arc<Notify>,
}

impl PodWatcher {
    /// Create a watcher for pods matching `selector` in `namespace`.
    pub fn new(
        source: Arc<dyn PodSource>,
        cache: Arc<PodCache>,
        namespace: impl Into<String>,
        selector: Selector,
    ) -> Self {
        Self {
            source,
            cache,
            namespace: namespace.into(),
            selector,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Open the watch stream.
    ///
    /// Open it before the initial list so no change between the two is lost.
    pub fn open(&self) -> BoxStream<'static, Result<SourceEvent, ApiError>> {
        self.source.watch(&self.namespace, &self.selector)
    }

    /// Load the initial listing into the cache.
    pub async fn sync(&self) -> Result<usize, ApiError> {
        let pods = self.source.list(&self.namespace, &self.selector).await?;
        let count = pods.len();
        self.cache.replace(pods).await;
        info!(
            namespace = %self.namespace,
            selector = %self.selector,
            pods = count,
            "Pod cache synced"
        );
        Ok(count)
    }

    /// Apply events from `stream` until shutdown, reopening it when it ends.
    pub async fn run(&self, mut stream: BoxStream<'static, Result<SourceEvent, ApiError>>) {
        info!(namespace = %self.namespace, "Pod watch started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Pod watch received shutdown signal");
                    break;
                }

                event = stream.next() => match event {
                    Some(Ok(event)) => self.cache.apply(event).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "Pod watch error");
                    }
                    None => {
                        debug!("Pod watch stream ended, reopening");
                        tokio::select! {
                            biased;

                            _ = self.shutdown.notified() => {
                                info!("Pod watch received shutdown signal");
                                break;
                            }
                            _ = tokio::time::sleep(RESTART_DELAY) => {}
                        }
                        stream = self.open();
                    }
                },
            }
        }

        info!("Pod watch stopped");
    }
}
