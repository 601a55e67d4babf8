use std::sync::Arc;

use tp_bridge::{EngineEvent, EventBus, EventEnvelope};
use tp_core::state_store::MemoryStateStore;
use tp_core::types::{HistoryAction, TaskStatus, WORKFLOW_TAG};
use tp_core::Config;
use tp_engine::{Progression, TaskUpdate, WorkflowEngine, WorkflowState, WorkflowTaskSpec};
use tp_intelligence::ModelGateway;
use uuid::Uuid;

fn engine() -> (WorkflowEngine, flume::Receiver<EventEnvelope>) {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let engine = WorkflowEngine::new(
        &Config::default(),
        ModelGateway::unavailable(),
        Arc::new(MemoryStateStore::new()),
        bus,
    );
    (engine, rx)
}

fn specs(contents: &[&str]) -> Vec<WorkflowTaskSpec> {
    contents.iter().map(|c| WorkflowTaskSpec::from(*c)).collect()
}

fn status(engine: &WorkflowEngine, id: Uuid) -> TaskStatus {
    engine.store().peek(id).expect("task").status
}

fn drain(rx: &flume::Receiver<EventEnvelope>) -> Vec<EngineEvent> {
    rx.try_iter().map(|e| e.event).collect()
}

#[tokio::test]
async fn creation_builds_a_chain_and_starts_nothing() {
    let (mut engine, rx) = engine();
    let wf = engine
        .create_workflow(specs(&["A", "B", "C"]), false)
        .await
        .expect("create workflow");

    assert_eq!(wf.task_ids.len(), 3);
    assert_eq!(engine.current_workflow(), Some(wf.workflow_id));
    for (i, task) in wf.tasks.iter().enumerate() {
        assert_eq!(task.position(), Some(i as u32));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.dependencies.contains(&task.id));
        assert!(task.tags.contains(&WORKFLOW_TAG.to_string()));
        assert!(task.tags.contains(&format!("workflow:{}", wf.workflow_id)));
        if i == 0 {
            assert!(task.dependencies.is_empty());
        } else {
            assert_eq!(task.dependencies, vec![wf.task_ids[i - 1]]);
        }
    }

    let events = drain(&rx);
    assert_eq!(
        events,
        vec![EngineEvent::WorkflowCreated {
            workflow_id: wf.workflow_id,
            task_ids: wf.task_ids.clone(),
        }]
    );
    let status = engine.workflow_status(wf.workflow_id).expect("status");
    assert_eq!(status.state, WorkflowState::NotStarted);
    assert_eq!(status.next_task, Some(wf.task_ids[0]));
}

#[tokio::test]
async fn empty_workflow_is_rejected() {
    let (mut engine, _rx) = engine();
    let err = engine.create_workflow(vec![], false).await.expect_err("empty");
    assert_eq!(err.kind(), "invalid_input");

    let err = engine
        .create_workflow(specs(&["A", "  "]), false)
        .await
        .expect_err("blank step");
    assert_eq!(err.kind(), "invalid_input");
    assert!(engine.store().is_empty());
}

#[tokio::test]
async fn auto_progression_walks_the_chain() {
    let (mut engine, rx) = engine();
    let wf = engine
        .create_workflow(specs(&["A", "B", "C"]), false)
        .await
        .expect("create workflow");
    let [a, b, c] = [wf.task_ids[0], wf.task_ids[1], wf.task_ids[2]];
    let wid = wf.workflow_id;
    engine.set_auto_progression(true).await;
    drain(&rx);

    engine.start_task(a).await.expect("start A");
    let report = engine.complete_task(a, None).await.expect("complete A");
    assert_eq!(report.progression, Some(Progression::Started { next_task: b }));
    assert_eq!(status(&engine, b), TaskStatus::InProgress);
    assert_eq!(status(&engine, c), TaskStatus::Pending);

    let started = engine.store().peek(b).expect("B");
    let entry = started.history.last().expect("history");
    assert_eq!(entry.action, HistoryAction::AutoProgressed);
    assert!(entry.notes.as_deref().unwrap_or_default().contains(&a.to_string()));

    engine.complete_task(b, None).await.expect("complete B");
    assert_eq!(status(&engine, c), TaskStatus::InProgress);

    let report = engine.complete_task(c, None).await.expect("complete C");
    assert_eq!(
        report.progression,
        Some(Progression::WorkflowCompleted { workflow_id: wid })
    );
    assert_eq!(engine.current_workflow(), None);

    assert_eq!(
        drain(&rx),
        vec![
            EngineEvent::TaskAutoProgressed {
                completed_task: a,
                next_task: b,
                workflow_id: wid,
            },
            EngineEvent::TaskAutoProgressed {
                completed_task: b,
                next_task: c,
                workflow_id: wid,
            },
            EngineEvent::WorkflowCompleted {
                workflow_id: wid,
                completed_task: c,
            },
        ]
    );
    let status = engine.workflow_status(wid).expect("status");
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.completion_ratio, 1.0);
}

#[tokio::test]
async fn completions_record_context() {
    let (mut engine, _rx) = engine();
    let wf = engine
        .create_workflow(specs(&["A", "B"]), false)
        .await
        .expect("create workflow");
    engine.set_auto_progression(true).await;
    // creation outline
    assert_eq!(engine.context().event_count(wf.workflow_id), 1);

    engine
        .complete_task(wf.task_ids[0], Some("parser merged".into()))
        .await
        .expect("complete A");
    // task result + progress note
    assert_eq!(engine.context().event_count(wf.workflow_id), 3);
    let snapshots = engine.context().snapshots(wf.workflow_id);
    assert!(snapshots[1].content.contains("parser merged"));
}

#[tokio::test]
async fn completing_later_task_never_starts_an_earlier_one() {
    let (mut engine, _rx) = engine();
    let wf = engine
        .create_workflow(specs(&["A", "B", "C", "D"]), false)
        .await
        .expect("create workflow");
    engine.set_auto_progression(true).await;

    engine.complete_task(wf.task_ids[2], None).await.expect("complete C");

    assert_eq!(status(&engine, wf.task_ids[0]), TaskStatus::Pending);
    assert_eq!(status(&engine, wf.task_ids[1]), TaskStatus::Pending);
    assert_eq!(status(&engine, wf.task_ids[3]), TaskStatus::InProgress);
}

#[tokio::test]
async fn no_successor_but_open_members_means_waiting() {
    let (mut engine, rx) = engine();
    let wf = engine
        .create_workflow(specs(&["A", "B"]), false)
        .await
        .expect("create workflow");
    engine.set_auto_progression(true).await;
    drain(&rx);

    let report = engine.complete_task(wf.task_ids[1], None).await.expect("complete B");
    assert_eq!(report.progression, Some(Progression::Waiting { remaining: 1 }));
    assert_eq!(engine.current_workflow(), Some(wf.workflow_id));
    assert!(drain(&rx).is_empty());
}

#[tokio::test]
async fn successor_with_unmet_dependency_stalls() {
    let (mut engine, _rx) = engine();
    let wf = engine
        .create_workflow(specs(&["A", "B"]), false)
        .await
        .expect("create workflow");
    let outside = engine
        .create_task("external review", None, vec![], vec![])
        .await
        .expect("outside task");
    engine
        .update_task(
            wf.task_ids[1],
            TaskUpdate {
                dependencies: Some(vec![wf.task_ids[0], outside.id]),
                ..Default::default()
            },
        )
        .await
        .expect("add dependency");
    engine.set_auto_progression(true).await;

    let report = engine.complete_task(wf.task_ids[0], None).await.expect("complete A");
    match report.progression {
        Some(Progression::Stalled { next_task, reason }) => {
            assert_eq!(next_task, wf.task_ids[1]);
            assert!(reason.contains(&outside.id.to_string()));
        }
        other => panic!("expected stall, got {other:?}"),
    }
    assert_eq!(status(&engine, wf.task_ids[1]), TaskStatus::Pending);
}

#[tokio::test]
async fn progression_is_off_by_default() {
    let (mut engine, rx) = engine();
    let wf = engine
        .create_workflow(specs(&["A", "B"]), false)
        .await
        .expect("create workflow");
    drain(&rx);

    let report = engine.complete_task(wf.task_ids[0], None).await.expect("complete A");
    assert!(report.progression.is_none());
    assert_eq!(status(&engine, wf.task_ids[1]), TaskStatus::Pending);
    assert!(drain(&rx).is_empty());
}

#[tokio::test]
async fn only_the_current_workflow_progresses() {
    let (mut engine, _rx) = engine();
    let first = engine
        .create_workflow(specs(&["A1", "B1"]), false)
        .await
        .expect("first");
    let second = engine
        .create_workflow(specs(&["A2", "B2"]), false)
        .await
        .expect("second");
    assert_eq!(engine.current_workflow(), Some(second.workflow_id));
    engine.set_auto_progression(true).await;

    engine.complete_task(first.task_ids[0], None).await.expect("complete A1");
    assert_eq!(status(&engine, first.task_ids[1]), TaskStatus::Pending);
    assert_eq!(status(&engine, second.task_ids[0]), TaskStatus::Pending);

    let loose = engine.create_task("loose end", None, vec![], vec![]).await.expect("loose");
    let report = engine.complete_task(loose.id, None).await.expect("complete loose");
    assert!(report.progression.is_none());
    assert_eq!(status(&engine, second.task_ids[0]), TaskStatus::Pending);
    assert_eq!(engine.current_workflow(), Some(second.workflow_id));

    engine.complete_task(second.task_ids[0], None).await.expect("complete A2");
    assert_eq!(status(&engine, second.task_ids[1]), TaskStatus::InProgress);
}

#[tokio::test]
async fn deleting_a_member_keeps_chain_and_positions() {
    let (mut engine, _rx) = engine();
    let wf = engine
        .create_workflow(specs(&["A", "B", "C"]), false)
        .await
        .expect("create workflow");

    engine.delete_task(wf.task_ids[1]).await.expect("delete B");

    let members = engine.workflow_members(wf.workflow_id);
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].position(), Some(0));
    assert_eq!(members[1].position(), Some(1));
    assert_eq!(members[1].dependencies, vec![wf.task_ids[0]]);

    let err = engine.delete_task(wf.task_ids[1]).await.expect_err("gone");
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn deleting_every_member_clears_current_workflow() {
    let (mut engine, _rx) = engine();
    let wf = engine
        .create_workflow(specs(&["only"]), false)
        .await
        .expect("create workflow");
    engine.delete_task(wf.task_ids[0]).await.expect("delete");
    assert_eq!(engine.current_workflow(), None);
    assert_eq!(
        engine.workflow_status(wf.workflow_id).expect_err("empty").kind(),
        "not_found"
    );
}

#[tokio::test]
async fn cancelled_member_abandons_workflow() {
    let (mut engine, rx) = engine();
    let wf = engine
        .create_workflow(specs(&["A", "B"]), false)
        .await
        .expect("create workflow");
    engine.set_auto_progression(true).await;
    engine.cancel_task(wf.task_ids[1], None).await.expect("cancel B");
    drain(&rx);

    let report = engine.complete_task(wf.task_ids[0], None).await.expect("complete A");
    assert_eq!(
        report.progression,
        Some(Progression::WorkflowCompleted {
            workflow_id: wf.workflow_id
        })
    );
    let status = engine.workflow_status(wf.workflow_id).expect("status");
    assert_eq!(status.state, WorkflowState::Abandoned);
}
