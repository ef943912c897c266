// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the pod GC controller.

use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::queue::RateLimiterConfig;

/// Controller configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch; empty watches all namespaces.
    pub namespace: String,
    /// Controller instance ID; empty selects pods without an instance label.
    pub instance_id: String,
    /// Number of cleanup workers.
    pub workers: usize,
    /// Grace period passed on pod deletes; unset uses the pod's own.
    pub grace_period_seconds: Option<i64>,
    /// Delay before deleting a pod when the workflow does not override it.
    pub delete_delay: Duration,
    /// Remove the status-capture finalizer when labelling pods completed.
    pub capture_finalizer: bool,
    /// First retry delay for a failing key.
    pub retry_base_delay: Duration,
    /// Cap on the per-key retry delay.
    pub retry_max_delay: Duration,
    /// Overall retries per second.
    pub qps: f64,
    /// Overall retry burst.
    pub burst: u32,
}

impl Default for Config {
    fn default() -> Self {
        let limits = RateLimiterConfig::default();
        Self {
            namespace: String::new(),
            instance_id: String::new(),
            workers: 4,
            grace_period_seconds: None,
            delete_delay: Duration::from_secs(5),
            capture_finalizer: false,
            retry_base_delay: limits.base_delay,
            retry_max_delay: limits.max_delay,
            qps: limits.qps,
            burst: limits.burst,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let namespace = var("PODGC_NAMESPACE").unwrap_or_default();
        let instance_id = var("PODGC_INSTANCE_ID").unwrap_or_default();

        let workers = parse_or(&var, "PODGC_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                name: "PODGC_WORKERS",
                value: "0".to_string(),
            });
        }

        let grace_period_seconds = match var("PODGC_GRACE_PERIOD_SECONDS") {
            Some(v) if !v.is_empty() => Some(v.parse().map_err(|_| ConfigError::InvalidValue {
                name: "PODGC_GRACE_PERIOD_SECONDS",
                value: v.clone(),
            })?),
            _ => None,
        };

        let delete_delay = match var("PODGC_DELETE_DELAY") {
            Some(v) if !v.is_empty() => {
                humantime::parse_duration(&v).map_err(|_| ConfigError::InvalidValue {
                    name: "PODGC_DELETE_DELAY",
                    value: v.clone(),
                })?
            }
            _ => defaults.delete_delay,
        };

        let capture_finalizer = var("ARGO_POD_STATUS_CAPTURE_FINALIZER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let retry_base_delay = Duration::from_millis(parse_or(
            &var,
            "PODGC_RETRY_BASE_DELAY_MS",
            defaults.retry_base_delay.as_millis() as u64,
        )?);
        let retry_max_delay = Duration::from_secs(parse_or(
            &var,
            "PODGC_RETRY_MAX_DELAY_SECS",
            defaults.retry_max_delay.as_secs(),
        )?);
        let qps: f64 = parse_or(&var, "PODGC_QPS", defaults.qps)?;
        if !qps.is_finite() || qps <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "PODGC_QPS",
                value: qps.to_string(),
            });
        }
        let burst = parse_or(&var, "PODGC_BURST", defaults.burst)?;

        Ok(Self {
            namespace,
            instance_id,
            workers,
            grace_period_seconds,
            delete_delay,
            capture_finalizer,
            retry_base_delay,
            retry_max_delay,
            qps,
            burst,
        })
    }

    /// Runtime settings for [`crate::controller::PodGcController`].
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.namespace.clone(),
            instance_id: self.instance_id.clone(),
            workers: self.workers,
            grace_period_seconds: self.grace_period_seconds,
            delete_delay: self.delete_delay,
            capture_finalizer: self.capture_finalizer,
            rate_limiter: RateLimiterConfig {
                base_delay: self.retry_base_delay,
                max_delay: self.retry_max_delay,
                qps: self.qps,
                burst: self.burst,
            },
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        Some(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: v }),
        _ => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set to a value that cannot be used.
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}
