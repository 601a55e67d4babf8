use std::sync::Arc;
use std::time::Duration;

use tp_bridge::EventBus;
use tp_core::state_store::MemoryStateStore;
use tp_core::Config;
use tp_daemon::Daemon;
use tp_engine::{CommandOutput, WorkflowEngine, WorkflowTaskSpec};
use tp_intelligence::ModelGateway;
use uuid::Uuid;

fn config() -> Config {
    let mut config = Config::default();
    config.monitor.interval_secs = 1;
    config
}

fn memory_engine(config: &Config) -> WorkflowEngine {
    WorkflowEngine::new(
        config,
        ModelGateway::unavailable(),
        Arc::new(MemoryStateStore::new()),
        EventBus::new(),
    )
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn envelopes(output: &[u8]) -> Vec<CommandOutput> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).expect("envelope"))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn created_workflows_get_a_monitor() {
    let config = config();
    let daemon = Arc::new(Daemon::with_engine(config.clone(), memory_engine(&config)));
    let runner = tokio::spawn({
        let daemon = daemon.clone();
        async move { daemon.run().await }
    });
    eventually(|| daemon.event_bus().subscriber_count() > 0).await;

    let created = daemon
        .engine()
        .lock()
        .await
        .create_workflow(vec![WorkflowTaskSpec::from("a"), WorkflowTaskSpec::from("b")], false)
        .await
        .expect("workflow");
    let wid = created.workflow_id;
    eventually(|| daemon.monitor().is_monitoring(wid)).await;

    daemon.shutdown();
    runner.await.expect("join").expect("run");
    assert!(daemon.monitor().active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn current_workflow_is_monitored_on_start() {
    let config = config();
    let mut engine = memory_engine(&config);
    let created = engine
        .create_workflow(vec![WorkflowTaskSpec::from("resume me")], false)
        .await
        .expect("workflow");
    let daemon = Arc::new(Daemon::with_engine(config, engine));

    let runner = tokio::spawn({
        let daemon = daemon.clone();
        async move { daemon.run().await }
    });
    eventually(|| daemon.monitor().is_monitoring(created.workflow_id)).await;

    daemon.shutdown();
    runner.await.expect("join").expect("run");
}

#[tokio::test]
async fn serves_line_delimited_commands() {
    let config = config();
    let daemon = Daemon::with_engine(config.clone(), memory_engine(&config));
    let input = concat!(
        r#"{"command":"create_task","args":{"content":"write docs"}}"#,
        "\n\n",
        "not json\n",
        r#"{"command":"summary"}"#,
        "\n",
    );
    let mut output = Vec::new();
    daemon
        .serve_lines(input.as_bytes(), &mut output)
        .await
        .expect("serve");

    let replies = envelopes(&output);
    assert_eq!(replies.len(), 3);
    assert!(replies[0].success);
    assert_eq!(replies[1].error_kind(), Some("invalid_input"));
    assert_eq!(replies[2].data.as_ref().expect("summary")["total"], 1);
}

#[tokio::test]
async fn serving_stops_on_shutdown() {
    let config = config();
    let daemon = Daemon::with_engine(config.clone(), memory_engine(&config));
    daemon.shutdown();
    let (reader, _writer) = tokio::io::duplex(64);
    let mut output = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(1),
        daemon.serve_lines(tokio::io::BufReader::new(reader), &mut output),
    )
    .await
    .expect("returns after shutdown")
    .expect("serve");
    assert!(output.is_empty());
}

#[tokio::test]
async fn state_and_context_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config();
    config.general.data_dir = dir.path().display().to_string();

    let daemon = Daemon::new(config.clone()).await.expect("daemon");
    let mut output = Vec::new();
    daemon
        .serve_lines(
            r#"{"command":"create_workflow","args":{"tasks":["plan","build"]}}"#.as_bytes(),
            &mut output,
        )
        .await
        .expect("serve");
    let reply = envelopes(&output).remove(0);
    assert!(reply.success, "{reply:?}");
    let wid: Uuid = serde_json::from_value(reply.data.expect("data")["workflow_id"].clone())
        .expect("workflow id");

    daemon.shutdown();
    daemon.run().await.expect("run");
    assert!(dir.path().join("state.json").exists());
    assert!(dir.path().join("context.json").exists());

    let restarted = Daemon::new(config).await.expect("restart");
    let engine = restarted.engine().lock().await;
    assert_eq!(engine.current_workflow(), Some(wid));
    assert_eq!(engine.workflow_members(wid).len(), 2);
    assert_eq!(engine.context().event_count(wid), 1);
}
