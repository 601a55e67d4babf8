//! One-shot engine session: restore state from the data directory, run a
//! single command, persist what changed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use tp_bridge::EventBus;
use tp_core::config::Config;
use tp_core::state_store::{FileStateStore, StateStore};
use tp_engine::{dispatch, dispatch_json, CommandOutput, WorkflowEngine};
use tp_intelligence::ModelGateway;

use crate::cli::Request;

const CONTEXT_FILE: &str = "context.json";

pub struct Session {
    engine: WorkflowEngine,
    context_path: PathBuf,
    startup_warnings: Vec<String>,
}

impl Session {
    pub async fn open(config: &Config) -> Result<Self> {
        let data_dir = config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&data_dir));
        let mut engine = WorkflowEngine::load(
            config,
            ModelGateway::from_config(config),
            store,
            EventBus::new(),
        )
        .await;

        let context_path = data_dir.join(CONTEXT_FILE);
        let workflows = engine.load_context_file(&context_path).await;
        debug!(data_dir = %data_dir.display(), workflows, "session opened");

        let startup_warnings = engine.take_warnings();
        for warning in &startup_warnings {
            warn!(%warning, "startup");
        }
        Ok(Self {
            engine,
            context_path,
            startup_warnings,
        })
    }

    /// Run the request and return its envelope, with startup and
    /// persistence warnings folded in.
    pub async fn run(mut self, request: Request) -> CommandOutput {
        let mut output = match request {
            Request::Command(command) => dispatch(&mut self.engine, command).await,
            Request::Raw(raw) => dispatch_json(&mut self.engine, &raw).await,
        };

        self.engine.save_context_file(&self.context_path).await;
        self.engine.shutdown();

        let mut warnings = self.startup_warnings;
        warnings.append(&mut output.warnings);
        warnings.extend(self.engine.take_warnings());
        output.warnings = warnings;
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tp_engine::Command;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.general.data_dir = dir.display().to_string();
        config
    }

    #[tokio::test]
    async fn state_carries_across_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());

        let session = Session::open(&config).await.expect("open");
        let created = session
            .run(Request::Raw(
                r#"{"command":"create_workflow","args":{"tasks":["plan","ship"]}}"#.into(),
            ))
            .await;
        assert!(created.success, "{created:?}");
        assert!(dir.path().join(CONTEXT_FILE).exists());

        let session = Session::open(&config).await.expect("reopen");
        let summary = session.run(Request::Command(Command::Summary)).await;
        let data = summary.data.expect("summary data");
        assert_eq!(data["total"], 2);
    }

    #[tokio::test]
    async fn corrupt_context_file_becomes_a_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONTEXT_FILE), "{ not json").expect("write");

        let session = Session::open(&config_in(dir.path())).await.expect("open");
        let output = session.run(Request::Command(Command::Summary)).await;
        assert!(output.success);
        assert!(output
            .warnings
            .iter()
            .any(|w| w.contains("context not persisted")));
    }

    #[tokio::test]
    async fn failures_still_produce_an_envelope() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = Session::open(&config_in(dir.path())).await.expect("open");
        let output = session
            .run(Request::Command(Command::GetTask {
                id: uuid::Uuid::new_v4(),
            }))
            .await;
        assert!(!output.success);
        assert_eq!(output.error_kind(), Some("not_found"));
    }
}
