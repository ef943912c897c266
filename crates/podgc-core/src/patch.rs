// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Merge patches applied to pods during cleanup.

use serde_json::{Map, Value, json};

use crate::pod::{FINALIZER_POD_STATUS, LABEL_COMPLETED, Pod};

/// Build the JSON merge patch that labels a pod completed and/or drops the
/// status finalizer.
///
/// Returns `None` when the pod already has the desired state, so callers can
/// skip the API call entirely. Finalizer changes carry the pod's
/// `resourceVersion`: merge patches replace the whole list, and a concurrent
/// change must surface as a conflict instead of being overwritten.
pub fn cleanup_patch(pod: &Pod, label_completed: bool, remove_finalizer: bool) -> Option<Value> {
    let mut metadata = Map::new();

    if label_completed && !pod.is_labelled_completed() {
        metadata.insert("labels".into(), json!({ LABEL_COMPLETED: "true" }));
    }

    if remove_finalizer && pod.has_status_finalizer() {
        let remaining: Vec<&str> = pod
            .finalizers
            .iter()
            .map(String::as_str)
            .filter(|f| *f != FINALIZER_POD_STATUS)
            .collect();
        metadata.insert("finalizers".into(), json!(remaining));
        if !pod.resource_version.is_empty() {
            metadata.insert("resourceVersion".into(), json!(pod.resource_version));
        }
    }

    if metadata.is_empty() {
        None
    } else {
        Some(json!({ "metadata": metadata }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with_finalizers(finalizers: &[&str]) -> Pod {
        Pod {
            resource_version: "42".into(),
            finalizers: finalizers.iter().map(|f| f.to_string()).collect(),
            ..Pod::new("argo", "wf-1").with_label(LABEL_COMPLETED, "false")
        }
    }

    #[test]
    fn test_label_only() {
        let pod = pod_with_finalizers(&[]);
        assert_eq!(
            cleanup_patch(&pod, true, true),
            Some(json!({"metadata": {"labels": {"workflows.argoproj.io/completed": "true"}}}))
        );
    }

    #[test]
    fn test_label_and_finalizer_in_one_patch() {
        let pod = pod_with_finalizers(&["keep.me/too", FINALIZER_POD_STATUS]);
        assert_eq!(
            cleanup_patch(&pod, true, true),
            Some(json!({"metadata": {
                "labels": {"workflows.argoproj.io/completed": "true"},
                "finalizers": ["keep.me/too"],
                "resourceVersion": "42"
            }}))
        );
    }

    #[test]
    fn test_finalizer_only() {
        let pod = pod_with_finalizers(&[FINALIZER_POD_STATUS]);
        assert_eq!(
            cleanup_patch(&pod, false, true),
            Some(json!({"metadata": {"finalizers": [], "resourceVersion": "42"}}))
        );
    }

    #[test]
    fn test_nothing_to_change_is_no_op() {
        // finalizer removal requested but the pod does not carry ours
        let pod = pod_with_finalizers(&["someone.else/finalizer"]);
        assert_eq!(cleanup_patch(&pod, false, true), None);

        // already labelled, finalizer removal disabled
        let pod = pod_with_finalizers(&[FINALIZER_POD_STATUS]).with_label(LABEL_COMPLETED, "true");
        assert_eq!(cleanup_patch(&pod, true, false), None);

        assert_eq!(cleanup_patch(&pod_with_finalizers(&[]), false, false), None);
    }
}
