// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PodGC Core - Workflow Pod Garbage Collection
//!
//! This crate drives the pods created for workflow executions to their final
//! disposition: deleted, labelled completed, stripped of the status finalizer,
//! or gracefully terminated. It has no Kubernetes client dependency; the
//! cluster is reached through the traits in [`client`] and [`signal`], which
//! `podgc-controller` implements against a live API server.
//!
//! # Architecture
//!
//! ```text
//!   list/watch                          on significant change
//!  ┌──────────┐   SourceEvent   ┌──────────┐  ───────────────►  ┌──────────────┐
//!  │PodSource │ ──────────────► │ PodCache │                    │  reconciler  │
//!  └──────────┘   (PodWatcher)  └──────────┘  ◄─── lookups ───  └──────────────┘
//!                                     ▲                                │
//!                                     │ re-read                 resolve + enqueue
//!                                     │                                ▼
//!  ┌──────────┐  patch/delete   ┌──────────┐       keys         ┌──────────────┐
//!  │PodClient │ ◄────────────── │ workers  │ ◄───────────────── │  WorkQueue   │
//!  └──────────┘   signal        └──────────┘   retry w/ backoff └──────────────┘
//! ```
//!
//! # Cleanup actions
//!
//! | Action | Effect |
//! |--------|--------|
//! | `DeletePod` | label completed, then background delete |
//! | `LabelPodCompleted` | set `workflows.argoproj.io/completed=true` |
//! | `TerminateContainers` | SIGTERM, then `KillContainers` after the grace period |
//! | `KillContainers` | SIGKILL |
//! | `RemoveFinalizer` | drop `workflows.argoproj.io/status` |
//!
//! See [`action::resolve`] for how an action is chosen.

#![deny(missing_docs)]

/// Cleanup actions, GC policy and the resolver.
pub mod action;

/// Indexed pod cache with change notification.
pub mod cache;

/// Cluster API traits and error classification.
pub mod client;

/// Configuration loaded from environment variables.
pub mod config;

/// Cleanup workers and enqueue helpers.
pub mod controller;

/// Error types for engine operations.
pub mod error;

/// Cleanup queue key codec.
pub mod key;

/// In-memory cluster for tests.
pub mod mock;

/// Cleanup merge patches.
pub mod patch;

/// Pod snapshot and well-known labels.
pub mod pod;

/// Rate-limited work queue.
pub mod queue;

/// Embeddable runtime.
pub mod runtime;

/// Label selectors.
pub mod selector;

/// Container signalling.
pub mod signal;

/// Watch task feeding the cache.
pub mod watch;

pub use action::{CleanupAction, PodGcStrategy, WorkflowPhase, resolve};
pub use cache::{PodCache, PodEventHandler};
pub use client::{ApiError, PodClient, PodSource, SourceEvent};
pub use config::Config;
pub use controller::{ControllerConfig, PodGcController, WorkflowGcContext};
pub use error::Error;
pub use pod::{Pod, PodPhase};
pub use runtime::PodGcRuntime;
