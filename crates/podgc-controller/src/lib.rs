// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes adapter for the workflow pod garbage collector.
//!
//! Connects the `podgc-core` engine to a live cluster:
//!
//! ```text
//!   kube::runtime::watcher ──► KubeCluster (PodSource) ──► PodCache
//!                                                            │
//!   PodGcController workers ──► KubeCluster (PodClient)  ◄───┘
//!                          └──► KubeCluster (ContainerSignaller, exec)
//! ```

#![deny(missing_docs)]

/// Conversion from API pods to engine pods
pub mod convert;

/// `kube` client implementations of the engine traits
pub mod kube_client;

pub use kube_client::KubeCluster;
