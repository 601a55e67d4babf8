//! Per-workflow event log with token accounting.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use tp_core::config::ContextConfig;
use tp_core::types::Priority;

/// Rough token estimate: one token per four characters, rounded up.
///
/// Counts Unicode scalar values, not bytes.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

// ---------------------------------------------------------------------------
// ContextSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    UserInput,
    TaskResult,
    AgentGuidance,
    ProgressNote,
    Checkpoint,
}

impl SnapshotKind {
    /// Fixed rendering order for grouped output.
    pub const ORDER: [SnapshotKind; 5] = [
        SnapshotKind::UserInput,
        SnapshotKind::TaskResult,
        SnapshotKind::AgentGuidance,
        SnapshotKind::ProgressNote,
        SnapshotKind::Checkpoint,
    ];

    pub fn heading(&self) -> &'static str {
        match self {
            SnapshotKind::UserInput => "User Input",
            SnapshotKind::TaskResult => "Task Results",
            SnapshotKind::AgentGuidance => "Agent Guidance",
            SnapshotKind::ProgressNote => "Progress Notes",
            SnapshotKind::Checkpoint => "Checkpoints",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SnapshotKind::UserInput => "user_input",
            SnapshotKind::TaskResult => "task_result",
            SnapshotKind::AgentGuidance => "agent_guidance",
            SnapshotKind::ProgressNote => "progress_note",
            SnapshotKind::Checkpoint => "checkpoint",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// One accumulated event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub content: String,
    /// Filled in by the accumulator when not supplied.
    #[serde(default)]
    pub tokens: Option<usize>,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
    /// Monotonic per-workflow sequence number, assigned on append.
    #[serde(default)]
    pub seq: u64,
}

impl ContextSnapshot {
    pub fn new(kind: SnapshotKind, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            content: content.into(),
            tokens: None,
            metadata: SnapshotMetadata::default(),
            seq: 0,
        }
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.metadata.task_id = Some(task_id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = Some(priority);
        self
    }

    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn token_count(&self) -> usize {
        self.tokens.unwrap_or_else(|| estimate_tokens(&self.content))
    }

    pub fn is_high_priority(&self) -> bool {
        self.metadata.priority.is_some_and(|p| p.is_high())
    }
}

// ---------------------------------------------------------------------------
// CompressedContext
// ---------------------------------------------------------------------------

/// Result of one successful AI compression. Replaced wholesale, never patched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedContext {
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub ratio: f64,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub technical_context: String,
    #[serde(default)]
    pub progress_status: String,
    /// Raw tail kept verbatim at compression time.
    pub recent_snapshots: Vec<ContextSnapshot>,
    pub compressed_at: DateTime<Utc>,
    /// Sequence number of the newest snapshot covered by this compression.
    pub covered_seq: u64,
    pub snapshot_count: usize,
}

// ---------------------------------------------------------------------------
// ContextAccumulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    pub max_items: usize,
    pub max_age: Duration,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            max_items: 100,
            max_age: Duration::hours(24),
        }
    }
}

impl From<&ContextConfig> for AccumulatorConfig {
    fn from(cfg: &ContextConfig) -> Self {
        Self {
            max_items: cfg.max_items_per_workflow.max(1),
            max_age: Duration::seconds(cfg.max_age_secs as i64),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub snapshots: Vec<ContextSnapshot>,
    #[serde(default)]
    pub next_seq: u64,
    #[serde(default)]
    pub compressed: Option<CompressedContext>,
}

impl WorkflowContext {
    /// Sequence number of the newest snapshot (0 when empty).
    pub fn last_seq(&self) -> u64 {
        self.snapshots.last().map(|s| s.seq).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_snapshots: usize,
    pub expired_summaries: usize,
    pub removed_workflows: usize,
}

/// Owns every workflow's event log. Only the engine mutates it.
#[derive(Debug, Default)]
pub struct ContextAccumulator {
    config: AccumulatorConfig,
    workflows: HashMap<Uuid, WorkflowContext>,
}

impl ContextAccumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            config,
            workflows: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    /// Append a snapshot, returning its token estimate.
    ///
    /// The oldest entries are evicted once the log exceeds `max_items`.
    pub fn add_context(&mut self, workflow_id: Uuid, mut snapshot: ContextSnapshot) -> usize {
        let tokens = snapshot.token_count();
        snapshot.tokens = Some(tokens);
        snapshot.metadata.workflow_id.get_or_insert(workflow_id);

        let entry = self.workflows.entry(workflow_id).or_default();
        entry.next_seq += 1;
        snapshot.seq = entry.next_seq;
        entry.snapshots.push(snapshot);

        if entry.snapshots.len() > self.config.max_items {
            let excess = entry.snapshots.len() - self.config.max_items;
            entry.snapshots.drain(..excess);
            debug!(workflow_id = %workflow_id, evicted = excess, "context log truncated");
        }
        tokens
    }

    pub fn snapshots(&self, workflow_id: Uuid) -> &[ContextSnapshot] {
        self.workflows
            .get(&workflow_id)
            .map(|w| w.snapshots.as_slice())
            .unwrap_or(&[])
    }

    pub fn workflow(&self, workflow_id: Uuid) -> Option<&WorkflowContext> {
        self.workflows.get(&workflow_id)
    }

    pub fn total_tokens(&self, workflow_id: Uuid) -> usize {
        self.snapshots(workflow_id)
            .iter()
            .map(ContextSnapshot::token_count)
            .sum()
    }

    pub fn event_count(&self, workflow_id: Uuid) -> usize {
        self.snapshots(workflow_id).len()
    }

    pub fn compressed(&self, workflow_id: Uuid) -> Option<&CompressedContext> {
        self.workflows
            .get(&workflow_id)
            .and_then(|w| w.compressed.as_ref())
    }

    pub fn store_compressed(&mut self, workflow_id: Uuid, compressed: CompressedContext) {
        self.workflows.entry(workflow_id).or_default().compressed = Some(compressed);
    }

    pub fn workflow_ids(&self) -> Vec<Uuid> {
        self.workflows.keys().copied().collect()
    }

    pub fn remove_workflow(&mut self, workflow_id: Uuid) -> bool {
        self.workflows.remove(&workflow_id).is_some()
    }

    pub fn clear(&mut self) {
        self.workflows.clear();
    }

    pub fn cleanup_old_context(&mut self) -> CleanupReport {
        self.cleanup_at(Utc::now())
    }

    /// Drop snapshots and summaries older than `max_age` relative to `now`,
    /// then drop workflows left with no snapshots.
    pub fn cleanup_at(&mut self, now: DateTime<Utc>) -> CleanupReport {
        let cutoff = now - self.config.max_age;
        let mut report = CleanupReport::default();

        for ctx in self.workflows.values_mut() {
            let before = ctx.snapshots.len();
            ctx.snapshots.retain(|s| s.timestamp >= cutoff);
            report.removed_snapshots += before - ctx.snapshots.len();

            if ctx.compressed.as_ref().is_some_and(|c| c.compressed_at < cutoff) {
                ctx.compressed = None;
                report.expired_summaries += 1;
            }
        }

        let before = self.workflows.len();
        self.workflows.retain(|_, ctx| !ctx.snapshots.is_empty());
        report.removed_workflows = before - self.workflows.len();

        if report != CleanupReport::default() {
            debug!(
                removed_snapshots = report.removed_snapshots,
                expired_summaries = report.expired_summaries,
                removed_workflows = report.removed_workflows,
                "context cleanup"
            );
        }
        report
    }

    /// Owned copy of every workflow log, for callers that persist context.
    pub fn export(&self) -> HashMap<Uuid, WorkflowContext> {
        self.workflows.clone()
    }

    pub fn import(&mut self, workflows: HashMap<Uuid, WorkflowContext>) {
        self.workflows = workflows;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // four multi-byte chars are one token
        assert_eq!(estimate_tokens("ééé€"), 1);
    }

    #[test]
    fn add_context_fills_estimate_and_workflow() {
        let mut acc = ContextAccumulator::default();
        let wid = Uuid::new_v4();
        let tokens = acc.add_context(wid, ContextSnapshot::new(SnapshotKind::UserInput, "hello world"));
        assert_eq!(tokens, 3);
        let snap = &acc.snapshots(wid)[0];
        assert_eq!(snap.tokens, Some(3));
        assert_eq!(snap.metadata.workflow_id, Some(wid));
        assert_eq!(snap.seq, 1);
    }

    #[test]
    fn provided_token_count_is_kept() {
        let mut acc = ContextAccumulator::default();
        let wid = Uuid::new_v4();
        acc.add_context(
            wid,
            ContextSnapshot::new(SnapshotKind::TaskResult, "short").with_tokens(500),
        );
        assert_eq!(acc.total_tokens(wid), 500);
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let mut acc = ContextAccumulator::new(AccumulatorConfig {
            max_items: 3,
            ..Default::default()
        });
        let wid = Uuid::new_v4();
        for i in 0..5 {
            acc.add_context(wid, ContextSnapshot::new(SnapshotKind::ProgressNote, format!("note {i}")));
        }
        let contents: Vec<&str> = acc.snapshots(wid).iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["note 2", "note 3", "note 4"]);
        assert_eq!(acc.workflow(wid).expect("workflow").last_seq(), 5);
    }

    #[test]
    fn cleanup_removes_old_entries_and_empty_workflows() {
        let mut acc = ContextAccumulator::default();
        let stale = Uuid::new_v4();
        let live = Uuid::new_v4();
        let old = Utc::now() - Duration::hours(25);

        acc.add_context(stale, ContextSnapshot::new(SnapshotKind::UserInput, "old").with_timestamp(old));
        acc.add_context(live, ContextSnapshot::new(SnapshotKind::UserInput, "old").with_timestamp(old));
        acc.add_context(live, ContextSnapshot::new(SnapshotKind::UserInput, "fresh"));
        acc.store_compressed(
            live,
            CompressedContext {
                original_tokens: 10,
                compressed_tokens: 5,
                ratio: 0.5,
                summary: "s".into(),
                key_points: vec![],
                technical_context: String::new(),
                progress_status: String::new(),
                recent_snapshots: vec![],
                compressed_at: old,
                covered_seq: 2,
                snapshot_count: 2,
            },
        );

        let report = acc.cleanup_old_context();
        assert_eq!(report.removed_snapshots, 2);
        assert_eq!(report.expired_summaries, 1);
        assert_eq!(report.removed_workflows, 1);
        assert!(acc.workflow(stale).is_none());
        assert_eq!(acc.event_count(live), 1);
        assert!(acc.compressed(live).is_none());
    }

    #[test]
    fn unknown_workflow_is_empty() {
        let acc = ContextAccumulator::default();
        let wid = Uuid::new_v4();
        assert!(acc.snapshots(wid).is_empty());
        assert_eq!(acc.total_tokens(wid), 0);
    }
}
