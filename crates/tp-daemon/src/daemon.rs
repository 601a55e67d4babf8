use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tp_bridge::{EngineEvent, EventBus, EventEnvelope};
use tp_core::config::Config;
use tp_core::state_store::{FileStateStore, StateStore};
use tp_engine::{dispatch_json, SharedEngine, WorkflowEngine};
use tp_intelligence::ModelGateway;

use crate::monitor::{MonitorSettings, WorkflowMonitor};
use crate::shutdown::{DrainOutcome, ShutdownGuard, ShutdownSignal};

/// File under the data directory holding the context log.
pub const CONTEXT_FILE: &str = "context.json";

/// Loops that hold a shutdown guard while `run` is active.
const BACKGROUND_LOOPS: usize = 2;

/// Intervals for the daemon's own loops.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// How often old context is pruned (default: 3600s).
    pub cleanup_secs: u64,
    /// How long shutdown waits for loops to drain (default: 5s).
    pub drain_timeout_secs: u64,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self {
            cleanup_secs: 3600,
            drain_timeout_secs: 5,
        }
    }
}

impl From<&Config> for DaemonIntervals {
    fn from(config: &Config) -> Self {
        Self {
            cleanup_secs: config.context.cleanup_interval_secs.max(1),
            ..Self::default()
        }
    }
}

/// The long-running taskpilot host.
///
/// Starts a monitor for the current workflow and for every workflow created
/// while it runs, prunes old context on an interval, and shuts down when
/// the [`ShutdownSignal`] is triggered (e.g. via ctrl-c).
pub struct Daemon {
    config: Config,
    engine: SharedEngine,
    bus: EventBus,
    monitor: WorkflowMonitor,
    model_cancel: CancellationToken,
    shutdown: ShutdownSignal,
    intervals: DaemonIntervals,
    context_path: Option<PathBuf>,
}

impl Daemon {
    /// Open the JSON-file store under the configured data directory and
    /// restore the engine from it.
    pub async fn new(config: Config) -> Result<Self> {
        let data_dir = config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&data_dir));
        let gateway = ModelGateway::from_config(&config);
        info!(
            data_dir = %data_dir.display(),
            model = gateway.provider_name().unwrap_or("none"),
            "opening engine"
        );
        let mut engine = WorkflowEngine::load(&config, gateway, store, EventBus::new()).await;

        let context_path = data_dir.join(CONTEXT_FILE);
        engine.load_context_file(&context_path).await;
        for warning in engine.take_warnings() {
            warn!(%warning, "startup warning");
        }

        let mut daemon = Self::with_engine(config, engine);
        daemon.context_path = Some(context_path);
        Ok(daemon)
    }

    /// Wrap an already-built engine. Context is not saved on shutdown.
    pub fn with_engine(config: Config, engine: WorkflowEngine) -> Self {
        let bus = engine.bus().clone();
        let model_cancel = engine.cancel_token();
        let engine = engine.into_shared();
        let monitor = WorkflowMonitor::new(
            engine.clone(),
            bus.clone(),
            MonitorSettings::from(&config.monitor),
        );
        let intervals = DaemonIntervals::from(&config);
        Self {
            config,
            engine,
            bus,
            monitor,
            model_cancel,
            shutdown: ShutdownSignal::new(),
            intervals,
            context_path: None,
        }
    }

    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    pub fn monitor(&self) -> &WorkflowMonitor {
        &self.monitor
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Run until shutdown is triggered.
    pub async fn run(&self) -> Result<()> {
        let events = self.bus.subscribe();
        let current = self.engine.lock().await.current_workflow();
        if let Some(workflow_id) = current {
            self.monitor.start(workflow_id);
        }

        let listener = tokio::spawn(Self::follow_events(
            events,
            self.monitor.clone(),
            self.shutdown.clone(),
            self.shutdown.guard(),
        ));
        let cleanup = tokio::spawn(Self::cleanup_loop(
            self.engine.clone(),
            Duration::from_secs(self.intervals.cleanup_secs),
            self.shutdown.clone(),
            self.shutdown.guard(),
        ));
        info!(
            cleanup_secs = self.intervals.cleanup_secs,
            monitor_interval_secs = self.monitor.settings().interval.as_secs(),
            "daemon running"
        );

        self.shutdown.wait().await;
        self.monitor.shutdown();
        self.model_cancel.cancel();

        let timeout = Duration::from_secs(self.intervals.drain_timeout_secs);
        let base = self.shutdown.drained_count();
        if let DrainOutcome::TimedOut { drained, expected } = self
            .shutdown
            .wait_for_drain(base + BACKGROUND_LOOPS, timeout)
            .await
        {
            warn!(drained, expected, "aborting background loops");
            listener.abort();
            cleanup.abort();
        }

        if let Some(path) = &self.context_path {
            let mut engine = self.engine.lock().await;
            engine.save_context_file(path).await;
            for warning in engine.take_warnings() {
                warn!(%warning, "shutdown warning");
            }
        }
        info!("daemon stopped");
        Ok(())
    }

    async fn follow_events(
        events: flume::Receiver<EventEnvelope>,
        monitor: WorkflowMonitor,
        shutdown: ShutdownSignal,
        _guard: ShutdownGuard,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                received = events.recv_async() => {
                    let Ok(envelope) = received else {
                        debug!("event bus closed");
                        break;
                    };
                    match envelope.event {
                        EngineEvent::WorkflowCreated { workflow_id, task_ids } => {
                            debug!(workflow_id = %workflow_id, tasks = task_ids.len(), "workflow created");
                            monitor.start(workflow_id);
                        }
                        other => debug!(event = other.name(), seq = envelope.seq, "event observed"),
                    }
                }
            }
        }
    }

    async fn cleanup_loop(
        engine: SharedEngine,
        every: Duration,
        shutdown: ShutdownSignal,
        _guard: ShutdownGuard,
    ) {
        let mut interval = tokio::time::interval(every);
        // Skip the immediate first tick.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    engine.lock().await.cleanup_context();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Line-delimited command input
    // ------------------------------------------------------------------

    /// Read one JSON command per line and write one envelope per line,
    /// until the input closes or shutdown is triggered.
    pub async fn serve_lines<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            let line = tokio::select! {
                _ = self.shutdown.wait() => break,
                line = lines.next_line() => line.context("failed to read command input")?,
            };
            let Some(line) = line else {
                debug!("command input closed");
                break;
            };
            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }

            let output = {
                let mut engine = self.engine.lock().await;
                dispatch_json(&mut engine, raw).await
            };
            let mut encoded =
                serde_json::to_string(&output).context("failed to encode command output")?;
            encoded.push('\n');
            writer
                .write_all(encoded.as_bytes())
                .await
                .context("failed to write command output")?;
            writer.flush().await.context("failed to flush command output")?;
        }
        Ok(())
    }
}
