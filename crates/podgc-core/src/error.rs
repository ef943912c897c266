// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for podgc-core.

use thiserror::Error;

use crate::client::ApiError;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A cluster API call failed.
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// A cleanup key could not be built.
    #[error("Invalid cleanup key: {0}")]
    Key(#[from] crate::key::KeyError),
}

impl Error {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Api(e) if e.is_transient())
    }
}

/// Result type using the engine Error.
pub type Result<T> = std::result::Result<T, Error>;
