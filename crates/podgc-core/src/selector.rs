// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes-style label selectors.
//!
//! Two shapes are supported:
//! - [`LabelSelector`], the serializable `matchLabels`/`matchExpressions` form
//!   used in pod GC policies;
//! - [`Selector`], the compiled list of [`Requirement`]s that is actually
//!   evaluated against pod labels and rendered into list/watch queries.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pod::{LABEL_COMPLETED, LABEL_CONTROLLER_INSTANCE_ID, LABEL_WORKFLOW};

/// Errors from compiling a [`LabelSelector`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// `In`/`NotIn` need at least one value.
    #[error("operator {operator} on key '{key}' requires at least one value")]
    MissingValues {
        /// Requirement key.
        key: String,
        /// Operator name.
        operator: String,
    },
    /// `Exists`/`DoesNotExist` take no values.
    #[error("operator {operator} on key '{key}' does not accept values")]
    UnexpectedValues {
        /// Requirement key.
        key: String,
        /// Operator name.
        operator: String,
    },
    /// Label keys cannot be empty.
    #[error("empty label key")]
    EmptyKey,
}

/// Operator in a selector requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// Label value is one of the given values.
    In,
    /// Label is absent or its value is none of the given values.
    NotIn,
    /// Label key is present.
    Exists,
    /// Label key is absent.
    DoesNotExist,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::In => "In",
            Operator::NotIn => "NotIn",
            Operator::Exists => "Exists",
            Operator::DoesNotExist => "DoesNotExist",
        };
        f.write_str(s)
    }
}

/// One entry of `matchExpressions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    /// Label key.
    pub key: String,
    /// Operator.
    pub operator: Operator,
    /// Values for `In`/`NotIn`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Serializable label selector as found in a pod GC policy.
///
/// An empty selector matches every pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Exact label matches.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Compile into an evaluable [`Selector`].
    pub fn to_selector(&self) -> Result<Selector, SelectorError> {
        let mut selector = Selector::everything();
        for (key, value) in &self.match_labels {
            selector = selector.with(Requirement::new(
                key.clone(),
                Operator::In,
                vec![value.clone()],
            )?);
        }
        for expr in &self.match_expressions {
            selector = selector.with(Requirement::new(
                expr.key.clone(),
                expr.operator,
                expr.values.clone(),
            )?);
        }
        Ok(selector)
    }
}

/// A single validated requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: Vec<String>,
}

impl Requirement {
    /// Validate and build a requirement. Values are sorted for stable rendering.
    pub fn new(
        key: impl Into<String>,
        operator: Operator,
        mut values: Vec<String>,
    ) -> Result<Self, SelectorError> {
        let key = key.into();
        if key.is_empty() {
            return Err(SelectorError::EmptyKey);
        }
        match operator {
            Operator::In | Operator::NotIn if values.is_empty() => {
                return Err(SelectorError::MissingValues {
                    key,
                    operator: operator.to_string(),
                });
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                return Err(SelectorError::UnexpectedValues {
                    key,
                    operator: operator.to_string(),
                });
            }
            _ => {}
        }
        values.sort();
        values.dedup();
        Ok(Self {
            key,
            operator,
            values,
        })
    }

    /// `key=value`
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::In,
            values: vec![value.into()],
        }
    }

    /// `key`
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::Exists,
            values: Vec::new(),
        }
    }

    /// `!key`
    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::DoesNotExist,
            values: Vec::new(),
        }
    }

    /// Evaluate against a label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .is_some_and(|v| self.values.iter().any(|x| x == v)),
            Operator::NotIn => labels
                .get(&self.key)
                .is_none_or(|v| !self.values.iter().any(|x| x == v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::In if self.values.len() == 1 => write!(f, "{}={}", self.key, self.values[0]),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn if self.values.len() == 1 => {
                write!(f, "{}!={}", self.key, self.values[0])
            }
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            Operator::Exists => f.write_str(&self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A conjunction of requirements. No requirements means "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
    nothing: bool,
}

impl Selector {
    /// A selector that matches every label set.
    pub fn everything() -> Self {
        Self::default()
    }

    /// A selector that matches no label set.
    pub fn nothing() -> Self {
        Self {
            requirements: Vec::new(),
            nothing: true,
        }
    }

    /// Add a requirement.
    pub fn with(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// True when every requirement matches.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.nothing && self.requirements.iter().all(|r| r.matches(labels))
    }

    /// True when the selector has no requirements.
    pub fn is_empty(&self) -> bool {
        !self.nothing && self.requirements.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nothing {
            // no label set both has and lacks a key
            return write!(f, "{LABEL_WORKFLOW},!{LABEL_WORKFLOW}");
        }
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Requirement scoping objects to a controller instance.
///
/// With an instance ID the label must equal it; without one the label must be absent.
pub fn instance_id_requirement(instance_id: &str) -> Requirement {
    if instance_id.is_empty() {
        Requirement::does_not_exist(LABEL_CONTROLLER_INSTANCE_ID)
    } else {
        Requirement::equals(LABEL_CONTROLLER_INSTANCE_ID, instance_id)
    }
}

/// Selector for pods the cache mirrors: workflow pods not yet labelled completed.
pub fn workflow_pod_selector(instance_id: &str) -> Selector {
    Selector::everything()
        .with(Requirement::exists(LABEL_WORKFLOW))
        .with(Requirement::equals(LABEL_COMPLETED, "false"))
        .with(instance_id_requirement(instance_id))
}
