// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signalling the processes of running containers.
//!
//! Delivery goes through the cluster's exec channel: a kill command is run
//! inside the target container against PID 1. The command can be overridden
//! per container with the `workflows.argoproj.io/kill-cmd-<container>`
//! annotation, a JSON string array in which `%d` is replaced by the signal
//! number.

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::client::ApiError;
use crate::pod::{ANNOTATION_KILL_CMD_PREFIX, Pod};

/// Delivers a signal to one container of a pod.
#[async_trait]
pub trait ContainerSignaller: Send + Sync {
    /// Send `signal` to the main process of `container`.
    async fn signal(&self, pod: &Pod, container: &str, signal: Signal) -> Result<(), ApiError>;
}

/// Command executed inside `container` to deliver `signal`.
pub fn kill_command(pod: &Pod, container: &str, signal: Signal) -> Vec<String> {
    let number = (signal as i32).to_string();
    let annotation = format!("{ANNOTATION_KILL_CMD_PREFIX}{container}");

    if let Some(raw) = pod.annotations.get(&annotation) {
        match serde_json::from_str::<Vec<String>>(raw) {
            Ok(args) if !args.is_empty() => {
                return args.into_iter().map(|a| a.replace("%d", &number)).collect();
            }
            Ok(_) => {
                warn!(pod = %pod.key(), container = %container, "Empty kill command override ignored");
            }
            Err(e) => {
                warn!(
                    pod = %pod.key(),
                    container = %container,
                    error = %e,
                    "Invalid kill command override ignored"
                );
            }
        }
    }

    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("kill -{number} 1"),
    ]
}

/// Outcome of a fan-out over a pod's containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalReport {
    /// Containers that accepted the signal.
    pub signalled: usize,
    /// Containers whose signalling failed.
    pub failed: usize,
}

/// Signal every running container of `pod`.
///
/// Best effort: a failure on one container is logged and the remaining
/// containers are still signalled.
pub async fn signal_running_containers(
    signaller: &dyn ContainerSignaller,
    pod: &Pod,
    signal: Signal,
) -> SignalReport {
    let mut report = SignalReport::default();
    for container in pod.running_containers() {
        match signaller.signal(pod, &container.name, signal).await {
            Ok(()) => {
                debug!(
                    pod = %pod.key(),
                    container = %container.name,
                    signal = signal.as_str(),
                    "Signalled container"
                );
                report.signalled += 1;
            }
            Err(e) => {
                info!(
                    pod = %pod.key(),
                    container = %container.name,
                    signal = signal.as_str(),
                    error = %e,
                    "Failed to signal container"
                );
                report.failed += 1;
            }
        }
    }
    report
}
