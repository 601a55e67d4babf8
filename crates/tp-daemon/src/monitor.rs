//! Per-workflow monitor timers.
//!
//! Each active workflow gets one interval loop, registered in a handle map
//! keyed by workflow id. A loop removes its own handle when the workflow
//! completes or is abandoned, so finished workflows never keep a timer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tp_bridge::{
    EngineEvent, EventBus, InterventionPayload, MonitorStopReason, WorkflowSummaryPayload,
};
use tp_core::config::MonitorConfig;
use tp_core::types::{Task, TaskStatus};
use tp_engine::SharedEngine;

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub blocked_threshold: Duration,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs.max(1)),
            blocked_threshold: Duration::from_secs(cfg.blocked_threshold_secs),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

/// What one tick concluded about a workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Still open; interventions not yet raised for this monitor.
    Running(Vec<InterventionPayload>),
    Completed(WorkflowSummaryPayload),
    /// No members left, or all terminal with at least one cancelled.
    Abandoned,
}

/// Inspect a workflow's members at `now`.
///
/// Tasks already in `notified` get no second intervention.
pub fn assess(
    workflow_id: Uuid,
    members: &[Task],
    now: DateTime<Utc>,
    blocked_threshold: Duration,
    notified: &mut HashSet<Uuid>,
) -> Verdict {
    if members.is_empty() {
        return Verdict::Abandoned;
    }
    if members.iter().all(|t| t.status == TaskStatus::Completed) {
        return Verdict::Completed(summarize(workflow_id, members, now));
    }
    if members.iter().all(|t| t.status.is_terminal()) {
        return Verdict::Abandoned;
    }

    let mut interventions = Vec::new();
    for task in members {
        if task.status != TaskStatus::Blocked || notified.contains(&task.id) {
            continue;
        }
        let Some(blocked_for) = task
            .blocked_since
            .and_then(|since| (now - since).to_std().ok())
        else {
            continue;
        };
        if blocked_for < blocked_threshold {
            continue;
        }
        notified.insert(task.id);
        let minutes = (blocked_for.as_secs() / 60) as i64;
        interventions.push(InterventionPayload {
            workflow_id,
            task_id: task.id,
            blocked_minutes: minutes,
            blocked_reason: task.blocked_reason.clone(),
            suggestion: format!(
                "'{}' has been blocked for {minutes} minutes ({}). Review its dependencies or unblock it manually.",
                task.content,
                task.blocked_reason.as_deref().unwrap_or("no reason recorded"),
            ),
        });
    }
    Verdict::Running(interventions)
}

fn summarize(workflow_id: Uuid, members: &[Task], now: DateTime<Utc>) -> WorkflowSummaryPayload {
    let start = members
        .iter()
        .map(|t| t.started_at.unwrap_or(t.created_at))
        .min()
        .unwrap_or(now);
    let end = members
        .iter()
        .filter_map(|t| t.completed_at)
        .max()
        .unwrap_or(now);
    let elapsed_minutes = ((end - start).num_milliseconds().max(0) as f64) / 60_000.0;
    let estimated_minutes: f64 = members.iter().filter_map(|t| t.estimated_minutes).sum();
    let efficiency = (elapsed_minutes > 0.0 && estimated_minutes > 0.0)
        .then(|| estimated_minutes / elapsed_minutes);

    WorkflowSummaryPayload {
        workflow_id,
        task_count: members.len(),
        elapsed_minutes,
        estimated_minutes,
        efficiency,
    }
}

// ---------------------------------------------------------------------------
// WorkflowMonitor
// ---------------------------------------------------------------------------

struct Handle {
    token: CancellationToken,
    generation: u64,
}

struct Inner {
    engine: SharedEngine,
    bus: EventBus,
    settings: MonitorSettings,
    handles: Mutex<HashMap<Uuid, Handle>>,
    root: CancellationToken,
    generation: AtomicU64,
}

/// Owns the monitor timers. Clones share the same handle map.
#[derive(Clone)]
pub struct WorkflowMonitor {
    inner: Arc<Inner>,
}

impl WorkflowMonitor {
    pub fn new(engine: SharedEngine, bus: EventBus, settings: MonitorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                bus,
                settings,
                handles: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start monitoring a workflow. Returns `false` when it is already
    /// monitored or the monitor has been shut down.
    pub fn start(&self, workflow_id: Uuid) -> bool {
        let mut handles = self.inner.handles.lock().expect("monitor handles poisoned");
        if self.inner.root.is_cancelled() {
            debug!(workflow_id = %workflow_id, "monitor shut down, not starting");
            return false;
        }
        if handles.contains_key(&workflow_id) {
            debug!(workflow_id = %workflow_id, "workflow already monitored");
            return false;
        }
        let token = self.inner.root.child_token();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        handles.insert(
            workflow_id,
            Handle {
                token: token.clone(),
                generation,
            },
        );
        drop(handles);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.watch(workflow_id, generation, token).await });
        info!(
            workflow_id = %workflow_id,
            interval_secs = self.inner.settings.interval.as_secs(),
            "workflow monitor started"
        );
        true
    }

    /// Cancel a workflow's timer. Returns `false` if none was running.
    pub fn stop(&self, workflow_id: Uuid) -> bool {
        let removed = self
            .inner
            .handles
            .lock()
            .expect("monitor handles poisoned")
            .remove(&workflow_id);
        match removed {
            Some(handle) => {
                handle.token.cancel();
                self.inner.bus.publish(EngineEvent::MonitorStopped {
                    workflow_id,
                    reason: MonitorStopReason::Stopped,
                });
                info!(workflow_id = %workflow_id, "workflow monitor stopped");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        let mut handles = self.inner.handles.lock().expect("monitor handles poisoned");
        let count = handles.len();
        handles.clear();
        info!(cancelled = count, "workflow monitors shut down");
    }

    pub fn is_monitoring(&self, workflow_id: Uuid) -> bool {
        self.inner
            .handles
            .lock()
            .expect("monitor handles poisoned")
            .contains_key(&workflow_id)
    }

    pub fn active(&self) -> Vec<Uuid> {
        self.inner
            .handles
            .lock()
            .expect("monitor handles poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn settings(&self) -> MonitorSettings {
        self.inner.settings
    }
}

impl Inner {
    async fn watch(self: Arc<Self>, workflow_id: Uuid, generation: u64, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        let mut notified = HashSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(workflow_id = %workflow_id, "monitor loop cancelled");
                    return;
                }
                _ = interval.tick() => {}
            }

            let members = self.engine.lock().await.workflow_members(workflow_id);
            if token.is_cancelled() {
                return;
            }
            let verdict = assess(
                workflow_id,
                &members,
                Utc::now(),
                self.settings.blocked_threshold,
                &mut notified,
            );
            match verdict {
                Verdict::Running(interventions) => {
                    for payload in interventions {
                        warn!(
                            workflow_id = %workflow_id,
                            task_id = %payload.task_id,
                            blocked_minutes = payload.blocked_minutes,
                            "task blocked past threshold"
                        );
                        self.bus.publish(EngineEvent::InterventionSuggested(payload));
                    }
                }
                Verdict::Completed(summary) => {
                    self.release(workflow_id, generation);
                    info!(
                        workflow_id = %workflow_id,
                        elapsed_minutes = summary.elapsed_minutes,
                        estimated_minutes = summary.estimated_minutes,
                        efficiency = ?summary.efficiency,
                        "workflow finished"
                    );
                    self.bus.publish(EngineEvent::WorkflowSummary(summary));
                    self.bus.publish(EngineEvent::MonitorStopped {
                        workflow_id,
                        reason: MonitorStopReason::Completed,
                    });
                    return;
                }
                Verdict::Abandoned => {
                    self.release(workflow_id, generation);
                    info!(workflow_id = %workflow_id, "workflow abandoned, monitor stopping");
                    self.bus.publish(EngineEvent::MonitorStopped {
                        workflow_id,
                        reason: MonitorStopReason::Abandoned,
                    });
                    return;
                }
            }
        }
    }

    /// Drop this loop's handle unless a newer loop replaced it.
    fn release(&self, workflow_id: Uuid, generation: u64) {
        let mut handles = self.handles.lock().expect("monitor handles poisoned");
        if handles
            .get(&workflow_id)
            .is_some_and(|h| h.generation == generation)
        {
            handles.remove(&workflow_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
