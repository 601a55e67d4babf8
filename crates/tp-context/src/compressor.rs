//! Token-budgeted context assembly for model prompts.
//!
//! Under budget the whole log is returned grouped by kind. Over budget a
//! recent AI summary is reused when still valid, otherwise a new one is
//! requested, and when the model is unavailable or unhelpful a deterministic
//! excerpt is built instead. Every path ends with the caller's prompt.

use std::fmt::Write as _;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tp_core::config::ContextConfig;
use tp_intelligence::{CompressionReply, ModelGateway};

use crate::accumulator::{
    estimate_tokens, CompressedContext, ContextAccumulator, ContextSnapshot, SnapshotKind,
};

/// Most recent snapshots always offered to the heuristic fallback.
const FALLBACK_RECENT: usize = 10;
/// Upper bound on snapshots in a heuristic excerpt.
const FALLBACK_MAX_ITEMS: usize = 20;
/// Per-snapshot character cap in a heuristic excerpt.
const FALLBACK_ITEM_CHARS: usize = 200;
/// Upper bound on the raw tail appended to a reused summary.
const MAX_REUSE_TAIL: usize = 5;

const CURRENT_REQUEST_HEADING: &str = "## Current Request\n";

const COMPRESSION_SYSTEM_PROMPT: &str = "You compress the working context of a multi-step \
workflow so an AI agent can continue it. Preserve decisions, results, open problems and \
technical details. Reply with a single JSON object and nothing else.";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CompressorConfig {
    pub max_tokens_before_compression: usize,
    /// Target size as a fraction of the original token count.
    pub compression_ratio: f64,
    pub validity: Duration,
    pub growth_tolerance: u64,
    pub retained_recent: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            max_tokens_before_compression: 100_000,
            compression_ratio: 0.7,
            validity: Duration::minutes(30),
            growth_tolerance: 5,
            retained_recent: 3,
        }
    }
}

impl From<&ContextConfig> for CompressorConfig {
    fn from(cfg: &ContextConfig) -> Self {
        Self {
            max_tokens_before_compression: cfg.max_tokens_before_compression,
            compression_ratio: cfg.compression_ratio,
            validity: Duration::seconds(cfg.compression_validity_secs as i64),
            growth_tolerance: cfg.compression_growth_tolerance as u64,
            retained_recent: cfg.retained_recent.clamp(1, MAX_REUSE_TAIL),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPath {
    /// Under budget: every snapshot verbatim.
    Full,
    /// Over budget: cached AI summary plus a raw tail.
    Reused,
    /// Over budget: a new AI summary was produced.
    Compressed,
    /// Over budget: deterministic excerpt.
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct AiContext {
    pub text: String,
    pub path: ContextPath,
    pub original_tokens: usize,
    pub output_tokens: usize,
}

// ---------------------------------------------------------------------------
// ContextCompressor
// ---------------------------------------------------------------------------

pub struct ContextCompressor {
    config: CompressorConfig,
    gateway: ModelGateway,
}

impl ContextCompressor {
    pub fn new(config: CompressorConfig, gateway: ModelGateway) -> Self {
        Self { config, gateway }
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    pub fn gateway(&self) -> &ModelGateway {
        &self.gateway
    }

    /// Context string for a model call, always ending with `prompt`.
    pub async fn get_context_for_ai(
        &self,
        acc: &mut ContextAccumulator,
        workflow_id: Uuid,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> String {
        self.build_context(acc, workflow_id, prompt, cancel)
            .await
            .text
    }

    pub async fn build_context(
        &self,
        acc: &mut ContextAccumulator,
        workflow_id: Uuid,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> AiContext {
        self.build_context_at(acc, workflow_id, prompt, cancel, Utc::now())
            .await
    }

    /// [`build_context`](Self::build_context) with an explicit clock.
    pub async fn build_context_at(
        &self,
        acc: &mut ContextAccumulator,
        workflow_id: Uuid,
        prompt: &str,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> AiContext {
        let total = acc.total_tokens(workflow_id);

        if total <= self.config.max_tokens_before_compression {
            let text = render_full(acc.snapshots(workflow_id), prompt);
            return self.finish(workflow_id, ContextPath::Full, total, text);
        }

        if let Some(text) = self.try_reuse(acc, workflow_id, prompt, now) {
            return self.finish(workflow_id, ContextPath::Reused, total, text);
        }

        match self.compress_with_model(acc, workflow_id, total, cancel, now).await {
            Some(compressed) => {
                let text = render_compressed(&compressed, acc.snapshots(workflow_id), prompt);
                acc.store_compressed(workflow_id, compressed);
                self.finish(workflow_id, ContextPath::Compressed, total, text)
            }
            None => {
                let text = self.render_fallback(acc.snapshots(workflow_id), total, prompt);
                self.finish(workflow_id, ContextPath::Fallback, total, text)
            }
        }
    }

    fn finish(&self, workflow_id: Uuid, path: ContextPath, total: usize, text: String) -> AiContext {
        let output_tokens = estimate_tokens(&text);
        debug!(
            workflow_id = %workflow_id,
            path = ?path,
            original_tokens = total,
            output_tokens,
            "assembled model context"
        );
        AiContext {
            text,
            path,
            original_tokens: total,
            output_tokens,
        }
    }

    /// A cached summary is valid while it is younger than `validity` and no
    /// more than `growth_tolerance` snapshots have arrived since.
    fn try_reuse(
        &self,
        acc: &ContextAccumulator,
        workflow_id: Uuid,
        prompt: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let ctx = acc.workflow(workflow_id)?;
        let compressed = ctx.compressed.as_ref()?;

        let age = now - compressed.compressed_at;
        let growth = ctx.next_seq.saturating_sub(compressed.covered_seq);
        if age >= self.config.validity || growth > self.config.growth_tolerance {
            debug!(
                workflow_id = %workflow_id,
                age_secs = age.num_seconds(),
                growth,
                "cached compression is stale"
            );
            return None;
        }
        Some(render_compressed(compressed, &ctx.snapshots, prompt))
    }

    async fn compress_with_model(
        &self,
        acc: &ContextAccumulator,
        workflow_id: Uuid,
        total: usize,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Option<CompressedContext> {
        if !self.gateway.is_available() {
            debug!(workflow_id = %workflow_id, "no model available, using heuristic compression");
            return None;
        }

        let snapshots = acc.snapshots(workflow_id);
        let target = target_tokens(total, self.config.compression_ratio);
        let request = compression_request(snapshots, total, target);

        let reply = match self
            .gateway
            .send_with_system(COMPRESSION_SYSTEM_PROMPT, &request, cancel)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "model compression failed, using heuristic");
                return None;
            }
        };

        let Some(parsed) = CompressionReply::parse(&reply) else {
            warn!(workflow_id = %workflow_id, "empty compression reply, using heuristic");
            return None;
        };

        let compressed_tokens = estimate_tokens(&parsed.render());
        if compressed_tokens >= total {
            warn!(
                workflow_id = %workflow_id,
                compressed_tokens,
                original_tokens = total,
                "model summary not smaller than original, using heuristic"
            );
            return None;
        }

        let keep = self.config.retained_recent.min(snapshots.len());
        let recent = snapshots[snapshots.len() - keep..].to_vec();
        let covered_seq = acc.workflow(workflow_id).map(|w| w.next_seq).unwrap_or(0);

        info!(
            workflow_id = %workflow_id,
            original_tokens = total,
            compressed_tokens,
            target_tokens = target,
            "context compressed"
        );

        Some(CompressedContext {
            original_tokens: total,
            compressed_tokens,
            ratio: compressed_tokens as f64 / total as f64,
            summary: parsed.summary,
            key_points: parsed.key_points,
            technical_context: parsed.technical_context,
            progress_status: parsed.progress_status,
            recent_snapshots: recent,
            compressed_at: now,
            covered_seq,
            snapshot_count: snapshots.len(),
        })
    }

    /// High-priority snapshots plus the most recent ones, each clipped,
    /// packed newest-first under `total × ratio × 4` characters.
    fn render_fallback(&self, snapshots: &[ContextSnapshot], total: usize, prompt: &str) -> String {
        let recent_start = snapshots.len().saturating_sub(FALLBACK_RECENT);
        let mut selected: Vec<&ContextSnapshot> = snapshots
            .iter()
            .enumerate()
            .filter(|(i, s)| *i >= recent_start || s.is_high_priority())
            .map(|(_, s)| s)
            .collect();
        if selected.len() > FALLBACK_MAX_ITEMS {
            selected.drain(..selected.len() - FALLBACK_MAX_ITEMS);
        }

        let budget_chars = (total as f64 * self.config.compression_ratio * 4.0) as usize;
        let mut used = 0usize;
        let mut kept: Vec<String> = Vec::new();
        for snap in selected.iter().rev() {
            let line = format!("- [{}] {}\n", snap.kind.label(), clip(&snap.content, FALLBACK_ITEM_CHARS));
            let len = line.chars().count();
            if used + len > budget_chars {
                break;
            }
            used += len;
            kept.push(line);
        }
        kept.reverse();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "## Context Summary ({} of {} events, ~{} tokens before compression)",
            kept.len(),
            snapshots.len(),
            total
        );
        for line in &kept {
            out.push_str(line);
        }
        out.push('\n');
        out.push_str(CURRENT_REQUEST_HEADING);
        out.push_str(prompt);
        out
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// `ceil(total × ratio)`.
pub fn target_tokens(total: usize, ratio: f64) -> usize {
    (total as f64 * ratio).ceil() as usize
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn render_grouped(snapshots: &[ContextSnapshot], out: &mut String) {
    for kind in SnapshotKind::ORDER {
        let mut group = snapshots.iter().filter(|s| s.kind == kind).peekable();
        if group.peek().is_none() {
            continue;
        }
        let _ = writeln!(out, "## {}", kind.heading());
        for snap in group {
            let _ = writeln!(out, "[{}] {}", snap.timestamp.to_rfc3339(), snap.content);
        }
        out.push('\n');
    }
}

/// Every snapshot grouped by kind, then the prompt.
pub fn render_full(snapshots: &[ContextSnapshot], prompt: &str) -> String {
    let mut out = String::new();
    render_grouped(snapshots, &mut out);
    out.push_str(CURRENT_REQUEST_HEADING);
    out.push_str(prompt);
    out
}

fn render_compressed(
    compressed: &CompressedContext,
    live: &[ContextSnapshot],
    prompt: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "## Compressed Context ({} events, {} -> {} tokens)",
        compressed.snapshot_count, compressed.original_tokens, compressed.compressed_tokens
    );
    let reply = CompressionReply {
        summary: compressed.summary.clone(),
        key_points: compressed.key_points.clone(),
        technical_context: compressed.technical_context.clone(),
        progress_status: compressed.progress_status.clone(),
    };
    out.push_str(&reply.render());
    out.push('\n');

    // Retained tail plus anything newer, newest five at most.
    let mut tail: Vec<&ContextSnapshot> = compressed.recent_snapshots.iter().collect();
    tail.extend(live.iter().filter(|s| s.seq > compressed.covered_seq));
    if tail.len() > MAX_REUSE_TAIL {
        tail.drain(..tail.len() - MAX_REUSE_TAIL);
    }
    if !tail.is_empty() {
        out.push_str("## Recent Activity\n");
        for snap in tail {
            let _ = writeln!(
                out,
                "[{}] ({}) {}",
                snap.timestamp.to_rfc3339(),
                snap.kind.label(),
                snap.content
            );
        }
        out.push('\n');
    }

    out.push_str(CURRENT_REQUEST_HEADING);
    out.push_str(prompt);
    out
}

fn compression_request(snapshots: &[ContextSnapshot], total: usize, target: usize) -> String {
    let mut body = String::new();
    render_grouped(snapshots, &mut body);
    format!(
        "Compress the workflow context below from about {total} tokens to at most {target} tokens.\n\
         \n\
         Respond with JSON of the form:\n\
         {{\"summary\": string, \"key_points\": [string], \"technical_context\": string, \"progress_status\": string}}\n\
         \n\
         If you cannot produce JSON, use these sections instead:\n\
         SUMMARY:\nKEY_POINTS:\nTECHNICAL_CONTEXT:\nPROGRESS_STATUS:\n\
         \n\
         --- CONTEXT ---\n{body}"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
