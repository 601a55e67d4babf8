//! Dependency resolution over the task store.
//!
//! A task may only run once every dependency is `completed`. A dependency id
//! that no longer exists in the store counts as unmet.

use ahash::{AHashMap, AHashSet};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use tp_core::types::{HistoryAction, TaskStatus};

use crate::error::{EngineError, Result};
use crate::store::TaskStore;

/// Dependencies of `task_id` that are not yet completed, in declaration
/// order.
pub fn unmet_dependencies(store: &TaskStore, task_id: Uuid) -> Vec<Uuid> {
    let Some(task) = store.peek(task_id) else {
        return Vec::new();
    };
    task.dependencies
        .iter()
        .copied()
        .filter(|dep| {
            store
                .peek(*dep)
                .map(|d| d.status != TaskStatus::Completed)
                .unwrap_or(true)
        })
        .collect()
}

/// Human-readable reason listing unmet dependency ids.
pub fn blocked_reason(unmet: &[Uuid]) -> String {
    let ids: Vec<String> = unmet.iter().map(Uuid::to_string).collect();
    format!("Waiting on dependencies: {}", ids.join(", "))
}

/// Unblock every blocked dependent of `completed_id` whose dependencies are
/// now all completed. Returns the ids moved back to `pending`.
pub fn resolve_completion(store: &mut TaskStore, completed_id: Uuid) -> Vec<Uuid> {
    let candidates: Vec<Uuid> = store
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked && t.dependencies.contains(&completed_id))
        .map(|t| t.id)
        .collect();
    unblock_ready(store, candidates, Some(completed_id))
}

/// Re-check the blocked tasks among `touched`, whose dependency lists were
/// just rewritten. Blocked tasks outside that set keep their block.
pub fn resolve_touched(store: &mut TaskStore, touched: &[Uuid]) -> Vec<Uuid> {
    let candidates: Vec<Uuid> = touched
        .iter()
        .copied()
        .filter(|id| store.peek(*id).is_some_and(|t| t.status == TaskStatus::Blocked))
        .collect();
    unblock_ready(store, candidates, None)
}

fn unblock_ready(store: &mut TaskStore, mut candidates: Vec<Uuid>, trigger: Option<Uuid>) -> Vec<Uuid> {
    candidates.sort();
    let mut unblocked = Vec::new();
    for id in candidates {
        if !unmet_dependencies(store, id).is_empty() {
            continue;
        }
        let notes = match trigger {
            Some(dep) => format!("dependency {dep} completed"),
            None => "dependencies resolved".to_string(),
        };
        let entry = store
            .entry(HistoryAction::Unblocked)
            .with_transition(TaskStatus::Blocked, TaskStatus::Pending)
            .with_notes(notes);
        if let Some(task) = store.get_mut(id) {
            task.status = TaskStatus::Pending;
            task.blocked_reason = None;
            task.blocked_since = None;
            task.record(entry);
            debug!(task_id = %id, "task unblocked");
            unblocked.push(id);
        }
    }
    unblocked
}

/// Validate a proposed dependency list for `task_id`: no self-dependency,
/// every id exists, and the resulting graph stays acyclic.
pub fn validate_dependencies(store: &TaskStore, task_id: Uuid, deps: &[Uuid]) -> Result<()> {
    if deps.contains(&task_id) {
        return Err(EngineError::InvalidInput(format!(
            "task {task_id} cannot depend on itself"
        )));
    }
    if let Some(missing) = deps.iter().find(|d| !store.contains(**d)) {
        return Err(EngineError::task_not_found(*missing));
    }

    let mut graph: AHashMap<Uuid, Vec<Uuid>> = store
        .iter()
        .map(|t| (t.id, t.dependencies.clone()))
        .collect();
    graph.insert(task_id, deps.to_vec());

    if reaches(&graph, deps, task_id) {
        return Err(EngineError::InvalidInput(format!(
            "dependencies of {task_id} would form a cycle"
        )));
    }
    Ok(())
}

/// Depth-first search from `starts` along dependency edges looking for
/// `target`.
fn reaches(graph: &AHashMap<Uuid, Vec<Uuid>>, starts: &[Uuid], target: Uuid) -> bool {
    let mut stack: Vec<Uuid> = starts.to_vec();
    let mut seen: AHashSet<Uuid> = AHashSet::new();
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = graph.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

/// Remove `deleted_id` from every dependency list, substituting the deleted
/// task's own dependencies so ordering survives. Returns the ids touched.
pub fn strip_dependency(store: &mut TaskStore, deleted_id: Uuid, inherited: &[Uuid]) -> Vec<Uuid> {
    let touched: Vec<Uuid> = store
        .iter()
        .filter(|t| t.dependencies.contains(&deleted_id))
        .map(|t| t.id)
        .collect();
    let now = Utc::now();
    for id in &touched {
        let Some(task) = store.get_mut(*id) else {
            continue;
        };
        task.dependencies.retain(|d| *d != deleted_id);
        for dep in inherited {
            if *dep != task.id && *dep != deleted_id && !task.dependencies.contains(dep) {
                task.dependencies.push(*dep);
            }
        }
        task.updated_at = now;
        debug!(task_id = %id, removed = %deleted_id, "dependency rewritten after delete");
    }
    touched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(store: &mut TaskStore, n: usize) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for i in 0..n {
            let id = store.create(&format!("t{i}"), None, vec![]).expect("create");
            if let Some(prev) = ids.last().copied() {
                store.get_mut(id).expect("task").dependencies.push(prev);
            }
            ids.push(id);
        }
        ids
    }

    #[test]
    fn missing_dependency_counts_as_unmet() {
        let mut store = TaskStore::new("test");
        let id = store.create("a", None, vec![]).expect("create");
        let ghost = Uuid::new_v4();
        store.get_mut(id).expect("task").dependencies.push(ghost);
        assert_eq!(unmet_dependencies(&store, id), vec![ghost]);
    }

    #[test]
    fn reason_lists_ids() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let reason = blocked_reason(&[a, b]);
        assert!(reason.contains(&a.to_string()));
        assert!(reason.contains(&b.to_string()));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut store = TaskStore::new("test");
        let ids = chain(&mut store, 3);
        let err = validate_dependencies(&store, ids[0], &[ids[2]]).expect_err("cycle");
        assert_eq!(err.kind(), "invalid_input");
        assert!(validate_dependencies(&store, ids[2], &[ids[0]]).is_ok());
    }

    #[test]
    fn self_and_unknown_dependencies_are_rejected() {
        let mut store = TaskStore::new("test");
        let ids = chain(&mut store, 1);
        assert_eq!(
            validate_dependencies(&store, ids[0], &[ids[0]])
                .expect_err("self")
                .kind(),
            "invalid_input"
        );
        assert_eq!(
            validate_dependencies(&store, ids[0], &[Uuid::new_v4()])
                .expect_err("unknown")
                .kind(),
            "not_found"
        );
    }

    #[test]
    fn resolve_touched_unblocks_after_strip() {
        let mut store = TaskStore::new("test");
        let ids = chain(&mut store, 2);
        store.get_mut(ids[1]).expect("task").status = TaskStatus::Blocked;
        store.delete(ids[0]);
        let touched = strip_dependency(&mut store, ids[0], &[]);
        assert_eq!(resolve_touched(&mut store, &touched), vec![ids[1]]);
        assert_eq!(store.peek(ids[1]).expect("task").status, TaskStatus::Pending);
    }
}
