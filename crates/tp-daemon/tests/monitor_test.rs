use std::sync::Arc;
use std::time::Duration;

use tp_bridge::{EngineEvent, EventBus, EventEnvelope, MonitorStopReason};
use tp_core::state_store::MemoryStateStore;
use tp_core::Config;
use tp_daemon::{MonitorSettings, WorkflowMonitor};
use tp_engine::{SharedEngine, WorkflowEngine, WorkflowTaskSpec};
use tp_intelligence::ModelGateway;
use uuid::Uuid;

struct Harness {
    engine: SharedEngine,
    monitor: WorkflowMonitor,
    events: flume::Receiver<EventEnvelope>,
}

fn harness(blocked_threshold: Duration) -> Harness {
    let bus = EventBus::new();
    let events = bus.subscribe();
    let engine = WorkflowEngine::new(
        &Config::default(),
        ModelGateway::unavailable(),
        Arc::new(MemoryStateStore::new()),
        bus.clone(),
    )
    .into_shared();
    let monitor = WorkflowMonitor::new(
        engine.clone(),
        bus,
        MonitorSettings {
            interval: Duration::from_secs(5),
            blocked_threshold,
        },
    );
    Harness {
        engine,
        monitor,
        events,
    }
}

async fn workflow(engine: &SharedEngine, steps: &[&str]) -> (Uuid, Vec<Uuid>) {
    let specs = steps.iter().map(|s| WorkflowTaskSpec::from(*s)).collect();
    let created = engine
        .lock()
        .await
        .create_workflow(specs, false)
        .await
        .expect("workflow");
    (created.workflow_id, created.task_ids)
}

async fn next_event<F>(events: &flume::Receiver<EventEnvelope>, matches: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let envelope = events.recv_async().await.expect("bus open");
            if matches(&envelope.event) {
                return envelope.event;
            }
        }
    })
    .await
    .expect("event before timeout")
}

fn count_interventions(events: &flume::Receiver<EventEnvelope>) -> usize {
    events
        .try_iter()
        .filter(|e| matches!(e.event, EngineEvent::InterventionSuggested(_)))
        .count()
}

#[tokio::test(start_paused = true)]
async fn blocked_task_gets_one_intervention() {
    let h = harness(Duration::ZERO);
    let (wid, ids) = workflow(&h.engine, &["migrate", "verify"]).await;
    h.engine.lock().await.start_task(ids[1]).await.expect("block verify");

    assert!(h.monitor.start(wid));
    let event = next_event(&h.events, |e| matches!(e, EngineEvent::InterventionSuggested(_))).await;
    let EngineEvent::InterventionSuggested(payload) = event else {
        unreachable!()
    };
    assert_eq!(payload.workflow_id, wid);
    assert_eq!(payload.task_id, ids[1]);
    assert!(payload.blocked_reason.is_some());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(count_interventions(&h.events), 0);
    assert!(h.monitor.is_monitoring(wid));
}

#[tokio::test(start_paused = true)]
async fn short_blocks_are_not_reported() {
    let h = harness(Duration::from_secs(30 * 60));
    let (wid, ids) = workflow(&h.engine, &["migrate", "verify"]).await;
    h.engine.lock().await.start_task(ids[1]).await.expect("block verify");

    h.monitor.start(wid);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(count_interventions(&h.events), 0);
}

#[tokio::test(start_paused = true)]
async fn completion_emits_summary_and_releases_timer() {
    let h = harness(Duration::ZERO);
    let (wid, ids) = workflow(&h.engine, &["only step"]).await;
    h.monitor.start(wid);

    {
        let mut engine = h.engine.lock().await;
        engine.start_task(ids[0]).await.expect("start");
        engine.complete_task(ids[0], None).await.expect("complete");
    }

    let summary = next_event(&h.events, |e| matches!(e, EngineEvent::WorkflowSummary(_))).await;
    let EngineEvent::WorkflowSummary(summary) = summary else {
        unreachable!()
    };
    assert_eq!(summary.workflow_id, wid);
    assert_eq!(summary.task_count, 1);

    let stopped = next_event(&h.events, |e| matches!(e, EngineEvent::MonitorStopped { .. })).await;
    assert_eq!(
        stopped,
        EngineEvent::MonitorStopped {
            workflow_id: wid,
            reason: MonitorStopReason::Completed,
        }
    );
    assert!(!h.monitor.is_monitoring(wid));
    assert!(h.monitor.active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn abandoned_workflow_stops_its_monitor() {
    let h = harness(Duration::ZERO);
    let (wid, ids) = workflow(&h.engine, &["a", "b"]).await;
    {
        let mut engine = h.engine.lock().await;
        engine.cancel_task(ids[0], None).await.expect("cancel a");
        engine.cancel_task(ids[1], None).await.expect("cancel b");
    }
    h.monitor.start(wid);

    let stopped = next_event(&h.events, |e| matches!(e, EngineEvent::MonitorStopped { .. })).await;
    assert_eq!(
        stopped,
        EngineEvent::MonitorStopped {
            workflow_id: wid,
            reason: MonitorStopReason::Abandoned,
        }
    );
    assert!(h.monitor.active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deleted_workflow_is_abandoned() {
    let h = harness(Duration::ZERO);
    let (wid, ids) = workflow(&h.engine, &["a"]).await;
    h.monitor.start(wid);
    h.engine.lock().await.delete_task(ids[0]).await.expect("delete");

    let stopped = next_event(&h.events, |e| matches!(e, EngineEvent::MonitorStopped { .. })).await;
    assert!(matches!(
        stopped,
        EngineEvent::MonitorStopped {
            reason: MonitorStopReason::Abandoned,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn starting_twice_keeps_one_timer() {
    let h = harness(Duration::ZERO);
    let (wid, _) = workflow(&h.engine, &["a"]).await;
    assert!(h.monitor.start(wid));
    assert!(!h.monitor.start(wid));
    assert_eq!(h.monitor.active(), vec![wid]);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_and_allows_restart() {
    let h = harness(Duration::ZERO);
    let (wid, _) = workflow(&h.engine, &["a"]).await;
    h.monitor.start(wid);

    assert!(h.monitor.stop(wid));
    assert!(!h.monitor.stop(wid));
    let stopped = next_event(&h.events, |e| matches!(e, EngineEvent::MonitorStopped { .. })).await;
    assert!(matches!(
        stopped,
        EngineEvent::MonitorStopped {
            reason: MonitorStopReason::Stopped,
            ..
        }
    ));

    assert!(h.monitor.start(wid));
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(h.monitor.is_monitoring(wid));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_every_timer() {
    let h = harness(Duration::ZERO);
    let (first, _) = workflow(&h.engine, &["a"]).await;
    let (second, _) = workflow(&h.engine, &["b"]).await;
    h.monitor.start(first);
    h.monitor.start(second);
    assert_eq!(h.monitor.active().len(), 2);

    h.monitor.shutdown();
    assert!(h.monitor.active().is_empty());
    assert!(!h.monitor.start(first));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h
        .events
        .try_iter()
        .all(|e| !matches!(e.event, EngineEvent::WorkflowSummary(_))));
}
