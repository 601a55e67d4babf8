//! Task analysis: time estimate, suggested subtasks, risks and
//! prerequisites.
//!
//! The model is asked for a strict JSON object. When it is unavailable,
//! fails, or returns something that does not validate, a keyword heuristic
//! produces the analysis instead.

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use tp_core::types::{AnalysisSource, HistoryAction, SubTask, Task, TaskAnalysis};
use tp_intelligence::parse_structured;

use crate::engine::WorkflowEngine;
use crate::error::Result;

const MAX_SUGGESTED_SUBTASKS: usize = 5;
const BASE_MINUTES: f64 = 15.0;
const MAX_MINUTES: f64 = 480.0;

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a planning assistant. Analyse the task you are \
given and reply with a single JSON object and nothing else.";

/// Keyword fragments that add to the estimate, and the minutes they add.
const EFFORT_KEYWORDS: &[(&str, f64)] = &[
    ("refactor", 30.0),
    ("migrat", 45.0),
    ("architect", 45.0),
    ("integrat", 30.0),
    ("security", 30.0),
    ("performance", 30.0),
    ("database", 30.0),
    ("deploy", 20.0),
    ("test", 15.0),
    ("document", 10.0),
];

const RISK_KEYWORDS: &[(&[&str], &str)] = &[
    (&["migrat", "database", "schema"], "Data changes may need a rollback plan"),
    (&["security", "auth", "credential", "secret"], "Security-sensitive change needs review"),
    (&["api", "integrat", "external", "third-party"], "External integration may fail or change"),
    (&["performance", "latency", "optimi"], "Performance work needs before/after measurement"),
    (&["refactor", "rewrite"], "Behaviour may regress; run the full test suite"),
    (&["deploy", "release", "production"], "Deployment may need a rollback path"),
];

#[derive(Debug, Deserialize)]
struct AnalysisReply {
    estimated_minutes: f64,
    #[serde(default)]
    subtasks: Vec<String>,
    #[serde(default)]
    risks: Vec<String>,
    #[serde(default)]
    prerequisites: Vec<String>,
    #[serde(default)]
    complexity: Option<String>,
}

impl WorkflowEngine {
    /// Analyse a task, store the result on it and persist.
    pub async fn analyze_task(&mut self, id: Uuid) -> Result<TaskAnalysis> {
        let analysis = self.analyze_in_place(id).await?;
        self.persist().await;
        Ok(analysis)
    }

    pub(crate) async fn analyze_in_place(&mut self, id: Uuid) -> Result<TaskAnalysis> {
        let task = self.store.require(id)?.clone();
        let dependency_contents: Vec<String> = task
            .dependencies
            .iter()
            .filter_map(|d| self.store.peek(*d).map(|t| t.content.clone()))
            .collect();

        let analysis = match self.analyze_with_model(&task, &dependency_contents).await {
            Some(analysis) => analysis,
            None => heuristic_analysis(&task, &dependency_contents),
        };

        let entry = self.store.entry(HistoryAction::Analyzed).with_notes(format!(
            "{} analysis, about {:.0} minutes",
            match analysis.source {
                AnalysisSource::Ai => "ai",
                AnalysisSource::Heuristic => "heuristic",
            },
            analysis.estimated_minutes
        ));
        let task = self.store.require_mut(id)?;
        if task.subtasks.is_empty() {
            task.subtasks = analysis
                .suggested_subtasks
                .iter()
                .map(|s| SubTask::new(s.clone()))
                .collect();
        }
        task.estimated_minutes.get_or_insert(analysis.estimated_minutes);
        task.analysis = Some(analysis.clone());
        task.record(entry);
        info!(task_id = %id, source = ?analysis.source, "task analysed");
        Ok(analysis)
    }

    async fn analyze_with_model(&self, task: &Task, dependencies: &[String]) -> Option<TaskAnalysis> {
        let gateway = self.gateway();
        if !gateway.is_available() {
            return None;
        }
        let prompt = analysis_prompt(task, dependencies);
        let cancel = self.cancel_token().child_token();
        let text = gateway
            .send_with_system(ANALYSIS_SYSTEM_PROMPT, &prompt, &cancel)
            .await
            .ok()?;
        let reply: AnalysisReply = match parse_structured(&text) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "analysis reply rejected, using heuristic");
                return None;
            }
        };
        if !reply.estimated_minutes.is_finite() || reply.estimated_minutes <= 0.0 {
            debug!(task_id = %task.id, "analysis reply has no usable estimate");
            return None;
        }

        let mut subtasks: Vec<String> = reply
            .subtasks
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        subtasks.truncate(MAX_SUGGESTED_SUBTASKS);
        Some(TaskAnalysis {
            estimated_minutes: reply.estimated_minutes.min(MAX_MINUTES),
            suggested_subtasks: subtasks,
            risks: reply.risks,
            prerequisites: reply.prerequisites,
            complexity: reply
                .complexity
                .or_else(|| Some(complexity_for(reply.estimated_minutes).to_string())),
            source: AnalysisSource::Ai,
            analyzed_at: Utc::now(),
        })
    }
}

fn analysis_prompt(task: &Task, dependencies: &[String]) -> String {
    let mut prompt = format!("Task: {}\n", task.content);
    if !dependencies.is_empty() {
        prompt.push_str("Depends on:\n");
        for dep in dependencies {
            prompt.push_str(&format!("- {dep}\n"));
        }
    }
    if let Some(objective) = &task.guidance.parent_objective {
        prompt.push_str(&format!("Overall objective: {objective}\n"));
    }
    prompt.push_str(
        "\nReply with JSON of the form:\n\
         {\"estimated_minutes\": <number>, \"subtasks\": [<at most 5 short steps>], \
         \"risks\": [<strings>], \"prerequisites\": [<strings>], \
         \"complexity\": \"low\" | \"medium\" | \"high\"}",
    );
    prompt
}

// ---------------------------------------------------------------------------
// Heuristic
// ---------------------------------------------------------------------------

/// Deterministic analysis used when the model cannot help.
pub fn heuristic_analysis(task: &Task, dependencies: &[String]) -> TaskAnalysis {
    let lower = task.content.to_lowercase();
    let minutes = estimate_minutes(&lower);

    let mut risks: Vec<String> = RISK_KEYWORDS
        .iter()
        .filter(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, risk)| risk.to_string())
        .collect();
    if risks.is_empty() && minutes >= 90.0 {
        risks.push("Large task; consider splitting it".to_string());
    }

    let mut prerequisites: Vec<String> = dependencies
        .iter()
        .map(|d| format!("Complete: {d}"))
        .collect();
    if task.requires_approval() {
        prerequisites.push("Obtain approval before starting".to_string());
    }

    TaskAnalysis {
        estimated_minutes: minutes,
        suggested_subtasks: split_into_steps(&task.content),
        risks,
        prerequisites,
        complexity: Some(complexity_for(minutes).to_string()),
        source: AnalysisSource::Heuristic,
        analyzed_at: Utc::now(),
    }
}

fn estimate_minutes(lower: &str) -> f64 {
    let words = lower.split_whitespace().count() as f64;
    let mut minutes = BASE_MINUTES + (words / 10.0).ceil() * 5.0;
    for (keyword, extra) in EFFORT_KEYWORDS {
        if lower.contains(keyword) {
            minutes += extra;
        }
    }
    minutes.min(MAX_MINUTES)
}

pub fn complexity_for(minutes: f64) -> &'static str {
    if minutes < 30.0 {
        "low"
    } else if minutes < 90.0 {
        "medium"
    } else {
        "high"
    }
}

/// Split task text on sentence and conjunction boundaries. Single-step
/// text gets a generic plan.
pub fn split_into_steps(content: &str) -> Vec<String> {
    let mut parts = vec![content.trim().to_string()];
    for sep in [". ", "; ", ", then ", " and then ", " then ", " and "] {
        parts = parts
            .iter()
            .flat_map(|p| p.split(sep))
            .map(|p| p.trim().trim_end_matches('.').trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
    }

    if parts.len() <= 1 {
        let subject = clip(content.trim().trim_end_matches('.'), 60);
        return vec![
            format!("Review requirements for {subject}"),
            format!("Implement {subject}"),
            format!("Verify {subject}"),
        ];
    }
    parts.truncate(MAX_SUGGESTED_SUBTASKS);
    parts
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push_str("...");
    clipped
}
