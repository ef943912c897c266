// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cleanup actions and the policy that selects them.
//!
//! [`resolve`] is the single decision point of the controller: given a pod's
//! labels, phase and finalizers together with the owning workflow's phase and
//! GC policy, it returns the one next step to take for that pod.
//!
//! # Decision order
//!
//! The cases overlap, so the first match wins:
//!
//! | # | Condition | Action |
//! |---|-----------|--------|
//! | 1 | labels do not match the policy selector | `LabelPodCompleted` |
//! | 2 | strategy `OnPodNone` | `LabelPodCompleted` |
//! | 3 | `OnWorkflowCompletion` and workflow completed | `DeletePod` |
//! | 4 | `OnWorkflowSuccess` and workflow succeeded | `DeletePod` |
//! | 5 | `OnPodCompletion` | `DeletePod` |
//! | 6 | `OnPodSuccess` and pod succeeded | `DeletePod` |
//! | 7 | `OnPodSuccess` and pod failed | `LabelPodCompleted` |
//! | 8 | workflow completed | `LabelPodCompleted` |
//! | 9 | pod carries the status finalizer | `RemoveFinalizer` |
//! | 10 | otherwise | `None` |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pod::{FINALIZER_POD_STATUS, PodPhase};
use crate::selector::{LabelSelector, Selector, SelectorError};

/// The single next step to apply to a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupAction {
    /// Nothing to do; never enqueued.
    None,
    /// Delete the pod.
    DeletePod,
    /// Label the pod `completed=true` so the cache stops tracking it.
    LabelPodCompleted,
    /// Send SIGTERM to running containers.
    TerminateContainers,
    /// Send SIGKILL to running containers.
    KillContainers,
    /// Drop the status-capture finalizer.
    RemoveFinalizer,
}

impl CleanupAction {
    /// Wire name used inside cleanup keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupAction::None => "",
            CleanupAction::DeletePod => "deletePod",
            CleanupAction::LabelPodCompleted => "labelPodCompleted",
            CleanupAction::TerminateContainers => "terminateContainers",
            CleanupAction::KillContainers => "killContainers",
            CleanupAction::RemoveFinalizer => "removeFinalizer",
        }
    }

    /// Actions that settle what happens to the pod: delete it, label it
    /// completed or drop its finalizer. A newer one replaces an older one.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            CleanupAction::DeletePod
                | CleanupAction::LabelPodCompleted
                | CleanupAction::RemoveFinalizer
        )
    }

    /// Every action for which [`is_final`](Self::is_final) holds.
    pub const FINAL: [CleanupAction; 3] = [
        CleanupAction::DeletePod,
        CleanupAction::LabelPodCompleted,
        CleanupAction::RemoveFinalizer,
    ];
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not a known action name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cleanup action '{0}'")]
pub struct UnknownAction(pub String);

impl FromStr for CleanupAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(CleanupAction::None),
            "deletePod" => Ok(CleanupAction::DeletePod),
            "labelPodCompleted" => Ok(CleanupAction::LabelPodCompleted),
            "terminateContainers" => Ok(CleanupAction::TerminateContainers),
            "killContainers" => Ok(CleanupAction::KillContainers),
            "removeFinalizer" => Ok(CleanupAction::RemoveFinalizer),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

/// When pods become eligible for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodGcStrategy {
    /// Never delete; pods are only labelled completed.
    #[default]
    #[serde(rename = "", alias = "OnPodNone")]
    OnPodNone,
    /// Delete each pod as soon as it completes.
    OnPodCompletion,
    /// Delete pods that succeeded; keep failed pods.
    OnPodSuccess,
    /// Delete all pods once the workflow completes.
    OnWorkflowCompletion,
    /// Delete all pods once the workflow succeeds.
    OnWorkflowSuccess,
}

/// Workflow phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkflowPhase {
    /// Not yet reconciled.
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Waiting to start.
    Pending,
    /// In progress.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failed node.
    Failed,
    /// Finished because of a controller-side error.
    Error,
}

impl WorkflowPhase {
    /// True for terminal phases.
    pub fn completed(&self) -> bool {
        matches!(
            self,
            WorkflowPhase::Succeeded | WorkflowPhase::Failed | WorkflowPhase::Error
        )
    }
}

/// Phase of a workflow node (the unit a pod executes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodePhase {
    /// Not started.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Skipped by a condition.
    Skipped,
    /// Finished with a failure.
    Failed,
    /// Finished with an error.
    Error,
    /// Not scheduled because its branch was not taken.
    Omitted,
}

impl NodePhase {
    /// True when the node will not change any further.
    pub fn fulfilled(&self) -> bool {
        matches!(
            self,
            NodePhase::Succeeded
                | NodePhase::Skipped
                | NodePhase::Failed
                | NodePhase::Error
                | NodePhase::Omitted
        )
    }
}

/// Pod GC policy attached to a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodGc {
    /// GC strategy; unset means [`PodGcStrategy::OnPodNone`].
    #[serde(default)]
    pub strategy: Option<PodGcStrategy>,
    /// Only pods matching this selector are deleted; unset matches all.
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    /// Delay before deleting a pod, as a duration string (`"30s"`, `"2m"`).
    #[serde(default)]
    pub delete_delay_duration: Option<String>,
}

impl PodGc {
    /// Effective strategy.
    pub fn strategy(&self) -> PodGcStrategy {
        self.strategy.unwrap_or_default()
    }

    /// Compiled label selector.
    pub fn selector(&self) -> Result<Selector, SelectorError> {
        match &self.label_selector {
            Some(selector) => selector.to_selector(),
            None => Ok(Selector::everything()),
        }
    }

    /// Parsed delete delay; `Ok(None)` when unset.
    pub fn delete_delay(&self) -> Result<Option<Duration>, humantime::DurationError> {
        match self.delete_delay_duration.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => humantime::parse_duration(s).map(Some),
        }
    }
}

/// Decide the next cleanup action for a pod. Pure and total.
pub fn resolve(
    selector: &Selector,
    pod_labels: &BTreeMap<String, String>,
    strategy: PodGcStrategy,
    workflow_phase: WorkflowPhase,
    pod_phase: PodPhase,
    finalizers: &[String],
) -> CleanupAction {
    use PodGcStrategy::*;

    match strategy {
        // never going to be deleted, so label it now
        _ if !selector.matches(pod_labels) => CleanupAction::LabelPodCompleted,
        OnPodNone => CleanupAction::LabelPodCompleted,
        OnWorkflowCompletion if workflow_phase.completed() => CleanupAction::DeletePod,
        OnWorkflowSuccess if workflow_phase == WorkflowPhase::Succeeded => {
            CleanupAction::DeletePod
        }
        OnPodCompletion => CleanupAction::DeletePod,
        OnPodSuccess if pod_phase == PodPhase::Succeeded => CleanupAction::DeletePod,
        OnPodSuccess if pod_phase == PodPhase::Failed => CleanupAction::LabelPodCompleted,
        _ if workflow_phase.completed() => CleanupAction::LabelPodCompleted,
        _ if has_status_finalizer(finalizers) => CleanupAction::RemoveFinalizer,
        _ => CleanupAction::None,
    }
}

/// Whether the finalizer list contains the controller's status finalizer.
pub fn has_status_finalizer(finalizers: &[String]) -> bool {
    finalizers.iter().any(|f| f == FINALIZER_POD_STATUS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Requirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn keep_selector() -> Selector {
        Selector::everything().with(Requirement::equals("gc", "yes"))
    }

    #[test]
    fn test_pod_success_deletes_succeeded_pod() {
        let action = resolve(
            &keep_selector(),
            &labels(&[("gc", "yes")]),
            PodGcStrategy::OnPodSuccess,
            WorkflowPhase::Running,
            PodPhase::Succeeded,
            &[],
        );
        assert_eq!(action, CleanupAction::DeletePod);
    }

    #[test]
    fn test_pod_success_keeps_failed_pod() {
        let action = resolve(
            &keep_selector(),
            &labels(&[("gc", "yes")]),
            PodGcStrategy::OnPodSuccess,
            WorkflowPhase::Running,
            PodPhase::Failed,
            &[],
        );
        assert_eq!(action, CleanupAction::LabelPodCompleted);
    }

    #[test]
    fn test_selector_mismatch_overrides_strategy() {
        let action = resolve(
            &keep_selector(),
            &labels(&[("gc", "no")]),
            PodGcStrategy::OnPodCompletion,
            WorkflowPhase::Succeeded,
            PodPhase::Succeeded,
            &[],
        );
        assert_eq!(action, CleanupAction::LabelPodCompleted);
    }

    #[test]
    fn test_on_pod_none_labels_completed() {
        let action = resolve(
            &Selector::everything(),
            &labels(&[]),
            PodGcStrategy::OnPodNone,
            WorkflowPhase::Running,
            PodPhase::Succeeded,
            &[FINALIZER_POD_STATUS.to_string()],
        );
        assert_eq!(action, CleanupAction::LabelPodCompleted);
    }

    #[test]
    fn test_workflow_strategies_wait_for_workflow() {
        let everything = Selector::everything();
        let none = labels(&[]);

        for phase in [WorkflowPhase::Succeeded, WorkflowPhase::Failed, WorkflowPhase::Error] {
            assert_eq!(
                resolve(&everything, &none, PodGcStrategy::OnWorkflowCompletion, phase, PodPhase::Succeeded, &[]),
                CleanupAction::DeletePod
            );
        }
        assert_eq!(
            resolve(&everything, &none, PodGcStrategy::OnWorkflowCompletion, WorkflowPhase::Running, PodPhase::Succeeded, &[]),
            CleanupAction::None
        );
        assert_eq!(
            resolve(&everything, &none, PodGcStrategy::OnWorkflowSuccess, WorkflowPhase::Succeeded, PodPhase::Failed, &[]),
            CleanupAction::DeletePod
        );
        // failed workflow under OnWorkflowSuccess falls through to the completed fallback
        assert_eq!(
            resolve(&everything, &none, PodGcStrategy::OnWorkflowSuccess, WorkflowPhase::Failed, PodPhase::Succeeded, &[]),
            CleanupAction::LabelPodCompleted
        );
    }

    #[test]
    fn test_on_pod_completion_deletes_regardless_of_phase() {
        for phase in [PodPhase::Succeeded, PodPhase::Failed, PodPhase::Running] {
            assert_eq!(
                resolve(&Selector::everything(), &labels(&[]), PodGcStrategy::OnPodCompletion, WorkflowPhase::Running, phase, &[]),
                CleanupAction::DeletePod
            );
        }
    }

    #[test]
    fn test_finalizer_removed_when_nothing_else_applies() {
        let action = resolve(
            &Selector::everything(),
            &labels(&[]),
            PodGcStrategy::OnPodSuccess,
            WorkflowPhase::Running,
            PodPhase::Running,
            &["other".to_string(), FINALIZER_POD_STATUS.to_string()],
        );
        assert_eq!(action, CleanupAction::RemoveFinalizer);

        let action = resolve(
            &Selector::everything(),
            &labels(&[]),
            PodGcStrategy::OnPodSuccess,
            WorkflowPhase::Running,
            PodPhase::Running,
            &["other".to_string()],
        );
        assert_eq!(action, CleanupAction::None);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let selector = keep_selector();
        let pod_labels = labels(&[("gc", "yes")]);
        let first = resolve(&selector, &pod_labels, PodGcStrategy::OnPodSuccess, WorkflowPhase::Running, PodPhase::Succeeded, &[]);
        for _ in 0..10 {
            let again = resolve(&selector, &pod_labels, PodGcStrategy::OnPodSuccess, WorkflowPhase::Running, PodPhase::Succeeded, &[]);
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_action_names_parse() {
        for action in [
            CleanupAction::None,
            CleanupAction::DeletePod,
            CleanupAction::LabelPodCompleted,
            CleanupAction::TerminateContainers,
            CleanupAction::KillContainers,
            CleanupAction::RemoveFinalizer,
        ] {
            assert_eq!(action.as_str().parse::<CleanupAction>(), Ok(action));
        }
        assert!("explode".parse::<CleanupAction>().is_err());
    }

    #[test]
    fn test_final_actions() {
        for action in CleanupAction::FINAL {
            assert!(action.is_final());
        }
        assert!(!CleanupAction::None.is_final());
        assert!(!CleanupAction::TerminateContainers.is_final());
        assert!(!CleanupAction::KillContainers.is_final());
    }

    #[test]
    fn test_pod_gc_policy_parsing() {
        let gc: PodGc = serde_json::from_value(serde_json::json!({
            "strategy": "OnPodSuccess",
            "labelSelector": {"matchLabels": {"gc": "yes"}},
            "deleteDelayDuration": "2m"
        }))
        .unwrap();
        assert_eq!(gc.strategy(), PodGcStrategy::OnPodSuccess);
        assert_eq!(gc.delete_delay().unwrap(), Some(Duration::from_secs(120)));
        assert!(gc.selector().unwrap().matches(&labels(&[("gc", "yes")])));

        let gc = PodGc::default();
        assert_eq!(gc.strategy(), PodGcStrategy::OnPodNone);
        assert_eq!(gc.delete_delay().unwrap(), None);
        assert!(gc.selector().unwrap().is_empty());

        let gc = PodGc {
            delete_delay_duration: Some("soon".into()),
            ..Default::default()
        };
        assert!(gc.delete_delay().is_err());
    }

    #[test]
    fn test_node_phase_fulfilled() {
        assert!(!NodePhase::Pending.fulfilled());
        assert!(!NodePhase::Running.fulfilled());
        assert!(NodePhase::Succeeded.fulfilled());
        assert!(NodePhase::Omitted.fulfilled());
    }
}
