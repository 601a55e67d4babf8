use std::sync::Arc;

use tp_bridge::EventBus;
use tp_core::state_store::MemoryStateStore;
use tp_core::types::{HistoryAction, TaskStatus};
use tp_core::Config;
use tp_engine::{EngineError, TransitionOutcome, WorkflowEngine, WorkflowTaskSpec};
use tp_intelligence::ModelGateway;

fn engine() -> WorkflowEngine {
    WorkflowEngine::new(
        &Config::default(),
        ModelGateway::unavailable(),
        Arc::new(MemoryStateStore::new()),
        EventBus::new(),
    )
}

fn gated_first() -> Vec<WorkflowTaskSpec> {
    vec![
        WorkflowTaskSpec::from("deploy to staging").with_approval(),
        WorkflowTaskSpec::from("smoke test"),
    ]
}

#[tokio::test]
async fn approval_required_task_starts_awaiting_approval() {
    let mut engine = engine();
    let wf = engine.create_workflow(gated_first(), false).await.expect("workflow");
    let gated = engine.store().peek(wf.task_ids[0]).expect("gated");
    assert_eq!(gated.status, TaskStatus::AwaitingApproval);
    assert!(gated.requires_approval());
    assert!(gated.dependencies.is_empty());
}

#[tokio::test]
async fn approve_moves_to_pending_without_auto_progression() {
    let mut engine = engine();
    let wf = engine.create_workflow(gated_first(), false).await.expect("workflow");

    let report = engine.approve_task(wf.task_ids[0], None).await.expect("approve");
    assert_eq!(report.task.status, TaskStatus::Pending);
    assert_eq!(
        report.outcome,
        TransitionOutcome::Applied {
            from: TaskStatus::AwaitingApproval,
            to: TaskStatus::Pending,
        }
    );
    assert_eq!(
        report.task.history.last().expect("entry").action,
        HistoryAction::Approved
    );
}

#[tokio::test]
async fn approve_starts_task_with_auto_progression() {
    let mut engine = engine();
    let wf = engine.create_workflow(gated_first(), false).await.expect("workflow");
    engine.set_auto_progression(true).await;

    let report = engine.approve_task(wf.task_ids[0], None).await.expect("approve");
    assert_eq!(report.task.status, TaskStatus::InProgress);
    assert!(report.task.started_at.is_some());
}

#[tokio::test]
async fn approve_does_not_start_while_sibling_runs() {
    let mut engine = engine();
    let wf = engine
        .create_workflow(
            vec![
                WorkflowTaskSpec::from("write migration"),
                WorkflowTaskSpec::from("review migration").with_approval(),
            ],
            false,
        )
        .await
        .expect("workflow");
    engine.set_auto_progression(true).await;
    engine.start_task(wf.task_ids[0]).await.expect("start first");

    let report = engine.approve_task(wf.task_ids[1], None).await.expect("approve");
    assert_eq!(report.task.status, TaskStatus::Pending);

    let done = engine.complete_task(wf.task_ids[0], None).await.expect("complete first");
    assert_eq!(
        engine.store().peek(wf.task_ids[1]).expect("second").status,
        TaskStatus::InProgress
    );
    assert!(done.progression.is_some());
}

#[tokio::test]
async fn approving_a_task_not_awaiting_approval_is_invalid() {
    let mut engine = engine();
    let task = engine.create_task("plain", None, vec![], vec![]).await.expect("task");
    let err = engine.approve_task(task.id, None).await.expect_err("not gated");
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: TaskStatus::Pending,
            to: TaskStatus::Pending,
            ..
        }
    ));
    assert_eq!(engine.store().peek(task.id).expect("task").history.len(), 1);
}

#[tokio::test]
async fn awaiting_approval_cannot_skip_approve() {
    let mut engine = engine();
    let wf = engine.create_workflow(gated_first(), false).await.expect("workflow");
    let err = engine
        .set_status(wf.task_ids[0], TaskStatus::Pending, None)
        .await
        .expect_err("must approve");
    assert_eq!(err.kind(), "invalid_transition");
    let err = engine.start_task(wf.task_ids[0]).await.expect_err("must approve");
    assert_eq!(err.kind(), "invalid_transition");
}
