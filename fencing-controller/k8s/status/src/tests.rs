use crate::controller::{make_patch, make_status, Published};
use maplit::btreemap;
use pg_fencing_controller_core::{Convergence, FencingState, InstanceId};
use pg_fencing_controller_k8s_api::{FencingStatus, Patch, ResourceId};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn mk_convergence(states: &[(&str, FencingState)], converged: bool) -> Convergence {
    Convergence {
        states: states
            .iter()
            .map(|(id, state)| (InstanceId::from(*id), *state))
            .collect(),
        converged,
        retry_after: (!converged).then_some(Duration::from_secs(1)),
        violations: vec![],
    }
}

#[test]
fn renders_instance_states() {
    let status = make_status(&mk_convergence(
        &[
            ("pg-1", FencingState::Fenced),
            ("pg-2", FencingState::UnfencingRequested),
            ("pg-3", FencingState::Unfenced),
        ],
        false,
    ));
    assert_eq!(
        status,
        FencingStatus {
            instances: btreemap! {
                "pg-1".to_string() => "Fenced".to_string(),
                "pg-2".to_string() => "UnfencingRequested".to_string(),
                "pg-3".to_string() => "Unfenced".to_string(),
            },
            converged: false,
        }
    );
}

#[test]
fn patch_merges_fencing_status() {
    let status = make_status(&mk_convergence(&[("pg-1", FencingState::Fenced)], true));
    let Patch::Merge(patch) = make_patch(None, &status) else {
        panic!("status must be merge patched");
    };
    assert_eq!(
        patch,
        serde_json::json!({
            "status": {
                "fencing": {
                    "instances": { "pg-1": "Fenced" },
                    "converged": true,
                },
            },
        })
    );
}

#[test]
fn patch_removes_departed_instances() {
    let previous = make_status(&mk_convergence(
        &[("pg-1", FencingState::Fenced), ("pg-3", FencingState::Fenced)],
        true,
    ));
    let status = make_status(&mk_convergence(&[("pg-1", FencingState::Fenced)], true));
    let Patch::Merge(patch) = make_patch(Some(&previous), &status) else {
        panic!("status must be merge patched");
    };
    assert_eq!(
        patch,
        serde_json::json!({
            "status": {
                "fencing": {
                    "instances": { "pg-1": "Fenced", "pg-3": null },
                    "converged": true,
                },
            },
        })
    );

    // Applying the patch to the stored resource leaves only live instances.
    let mut stored = serde_json::json!({
        "spec": { "instances": 3 },
        "status": { "currentPrimary": "pg-1", "fencing": previous },
    });
    merge(&mut stored, &patch);
    assert_eq!(
        stored,
        serde_json::json!({
            "spec": { "instances": 3 },
            "status": {
                "currentPrimary": "pg-1",
                "fencing": { "instances": { "pg-1": "Fenced" }, "converged": true },
            },
        })
    );
}

/// Applies a JSON merge patch the way the API server does.
fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(Default::default());
    }
    let serde_json::Value::Object(target) = target else {
        unreachable!()
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            merge(target.entry(key.clone()).or_insert(serde_json::Value::Null), value);
        }
    }
}

#[test]
fn unchanged_status_is_not_republished() {
    let id = ResourceId::new("db", "pg");
    let fenced = make_status(&mk_convergence(&[("pg-1", FencingState::Fenced)], true));
    let unfenced = make_status(&mk_convergence(&[("pg-1", FencingState::Unfenced)], true));

    let mut published = Published::default();
    assert!(published.is_changed(&id, &fenced));
    published.record(id.clone(), fenced.clone());
    assert!(!published.is_changed(&id, &fenced));
    assert!(published.is_changed(&id, &unfenced));
    assert!(published.is_changed(&ResourceId::new("db", "other"), &fenced));
    assert_eq!(published.get(&id), Some(&fenced));

    published.forget(&id);
    assert!(published.is_changed(&id, &fenced));

    published.record(id.clone(), fenced.clone());
    published.clear();
    assert!(published.is_changed(&id, &fenced));
}
