// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cleanup queue keys.
//!
//! A key identifies a pod together with the action to apply to it and is
//! serialized as `{namespace}/{name}/{action}`. Kubernetes names cannot
//! contain `/`, which keeps the encoding unambiguous; [`CleanupKey::new`]
//! rejects inputs that would break that.

use std::fmt;

use thiserror::Error;

use crate::action::CleanupAction;

const DELIMITER: char = '/';

/// Errors from building a cleanup key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    /// A field contains the key delimiter.
    #[error("{field} '{value}' contains '/'")]
    ContainsDelimiter {
        /// Which field.
        field: &'static str,
        /// Offending value.
        value: String,
    },
    /// The pod name is empty.
    #[error("pod name is empty")]
    EmptyName,
}

/// A pod plus the cleanup action to apply to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CleanupKey {
    namespace: String,
    name: String,
    action: CleanupAction,
}

impl CleanupKey {
    /// Build a key, rejecting names that would make the encoding ambiguous.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        action: CleanupAction,
    ) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.contains(DELIMITER) {
            return Err(KeyError::ContainsDelimiter {
                field: "namespace",
                value: namespace,
            });
        }
        if name.contains(DELIMITER) {
            return Err(KeyError::ContainsDelimiter {
                field: "name",
                value: name,
            });
        }
        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }
        Ok(Self {
            namespace,
            name,
            action,
        })
    }

    /// Pod namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Pod name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Action to apply.
    pub fn action(&self) -> CleanupAction {
        self.action
    }

    /// Serialize to the `{namespace}/{name}/{action}` token.
    pub fn encode(&self) -> String {
        encode(&self.namespace, &self.name, self.action)
    }
}

impl fmt::Display for CleanupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIMITER}{}{DELIMITER}{}",
            self.namespace, self.name, self.action
        )
    }
}

/// Join the three fields with `/`.
pub fn encode(namespace: &str, name: &str, action: CleanupAction) -> String {
    format!("{namespace}{DELIMITER}{name}{DELIMITER}{action}")
}

/// Split a token back into its parts.
///
/// Returns `None` unless the token has exactly three segments and the last
/// one is a known action.
pub fn decode(key: &str) -> Option<CleanupKey> {
    let mut parts = key.split(DELIMITER);
    let (Some(namespace), Some(name), Some(action), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    let action = action.parse().ok()?;
    CleanupKey::new(namespace, name, action).ok()
}
