// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster API seams used by the engine.
//!
//! The engine never talks to the API server directly. It reads pods through a
//! [`PodSource`] (list + watch) and mutates them through a [`PodClient`]
//! (merge patch + delete). Implementations live in `podgc-controller`
//! (live cluster) and [`crate::mock`] (tests).

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::pod::Pod;
use crate::selector::Selector;

/// Errors returned by cluster API calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApiError {
    /// The object does not exist (any more).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed (stale resourceVersion).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The server answered with an error status.
    #[error("API error {code}: {message}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Server-provided message.
        message: String,
    },

    /// The request did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection-level failure (refused, reset, TLS, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// How an API error should be treated by the retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The target is gone; treat as success for patch/delete.
    NotFound,
    /// Retry with backoff.
    Transient,
    /// Do not retry.
    Permanent,
}

/// Classify an HTTP status code.
///
/// - 404 → NotFound
/// - 408 Request Timeout, 409 Conflict, 429 Too Many Requests → Transient
/// - 5xx → Transient
/// - other 4xx and anything unexpected → Permanent
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        404 => ErrorCategory::NotFound,
        408 | 409 | 429 => ErrorCategory::Transient,
        500..=599 => ErrorCategory::Transient,
        _ => ErrorCategory::Permanent,
    }
}

impl ApiError {
    /// Build an error from a status response.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            _ => ApiError::Status { code, message },
        }
    }

    /// Retry category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ApiError::NotFound(_) => ErrorCategory::NotFound,
            ApiError::Conflict(_) | ApiError::Timeout(_) | ApiError::Transport(_) => {
                ErrorCategory::Transient
            }
            ApiError::Status { code, .. } => classify_http_status(*code),
            ApiError::Other(_) => ErrorCategory::Permanent,
        }
    }

    /// The target object no longer exists.
    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    /// Optimistic concurrency failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_)) || matches!(self, ApiError::Status { code: 409, .. })
    }

    /// Worth retrying with backoff (includes conflicts).
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Deletion propagation policy for dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationPolicy {
    /// Delete dependents in the background.
    #[default]
    Background,
    /// Delete dependents before the owner.
    Foreground,
    /// Leave dependents in place.
    Orphan,
}

/// Options for a pod delete.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteOptions {
    /// Dependent propagation.
    pub propagation: PropagationPolicy,
    /// Overrides the pod's own grace period when set.
    pub grace_period_seconds: Option<i64>,
}

/// Mutating pod operations.
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Apply a JSON merge patch.
    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ApiError>;

    /// Delete a pod.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ApiError>;
}

/// One change observed on the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// The pod was created or modified.
    Applied(Pod),
    /// The pod was deleted (last known state).
    Deleted(Pod),
    /// The watch restarted; this is the complete current set.
    Restarted(Vec<Pod>),
}

/// Read side of the pod API.
#[async_trait]
pub trait PodSource: Send + Sync {
    /// List pods matching `selector` in `namespace` (empty namespace = all).
    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>, ApiError>;

    /// Watch pods matching `selector` in `namespace`.
    ///
    /// The stream should resume on its own after recoverable errors; errors it
    /// yields are logged by the consumer, which keeps polling.
    fn watch(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> BoxStream<'static, Result<SourceEvent, ApiError>>;
}
