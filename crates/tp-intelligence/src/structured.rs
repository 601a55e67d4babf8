//! Parsing of model output into typed values.
//!
//! Structured contracts are parsed strictly with serde first. The free-text
//! section extractors are only used when the model ignored the JSON contract.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::llm::LlmError;

/// Cut the outermost `{ ... }` span out of `text`.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

/// Parse a JSON object out of model output (code fences and prose around it
/// are tolerated).
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let json = extract_json(text)
        .ok_or_else(|| LlmError::ParseError("no JSON object in response".into()))?;
    serde_json::from_str(json).map_err(|e| LlmError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Compression contract
// ---------------------------------------------------------------------------

/// Shape requested from the model when compressing workflow context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionReply {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub technical_context: String,
    #[serde(default)]
    pub progress_status: String,
}

impl CompressionReply {
    /// Strict JSON first, then the `SUMMARY:` / `KEY_POINTS:` section format.
    pub fn parse(text: &str) -> Option<Self> {
        if let Ok(reply) = parse_structured::<CompressionReply>(text) {
            if !reply.summary.trim().is_empty() {
                return Some(reply);
            }
        }
        let reply = CompressionReply {
            summary: extract_section(text, "SUMMARY").unwrap_or_default(),
            key_points: extract_key_points(text),
            technical_context: extract_section(text, "TECHNICAL_CONTEXT").unwrap_or_default(),
            progress_status: extract_section(text, "PROGRESS_STATUS").unwrap_or_default(),
        };
        if reply.summary.trim().is_empty() && reply.key_points.is_empty() {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return None;
            }
            // Unstructured prose is still a summary.
            return Some(CompressionReply {
                summary: trimmed.to_string(),
                ..Default::default()
            });
        }
        Some(reply)
    }

    /// Render in the fixed section layout used inside prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("SUMMARY:\n");
        out.push_str(self.summary.trim());
        out.push('\n');
        if !self.key_points.is_empty() {
            out.push_str("\nKEY_POINTS:\n");
            for point in &self.key_points {
                out.push_str("- ");
                out.push_str(point.trim());
                out.push('\n');
            }
        }
        if !self.technical_context.trim().is_empty() {
            out.push_str("\nTECHNICAL_CONTEXT:\n");
            out.push_str(self.technical_context.trim());
            out.push('\n');
        }
        if !self.progress_status.trim().is_empty() {
            out.push_str("\nPROGRESS_STATUS:\n");
            out.push_str(self.progress_status.trim());
            out.push('\n');
        }
        out
    }
}

const SECTION_MARKERS: &[&str] = &["SUMMARY", "KEY_POINTS", "TECHNICAL_CONTEXT", "PROGRESS_STATUS"];

fn marker_at(line: &str) -> Option<&'static str> {
    let upper = line.trim_start_matches(['#', '*', ' ']).to_ascii_uppercase();
    SECTION_MARKERS
        .iter()
        .find(|m| upper.starts_with(&format!("{m}:")))
        .copied()
}

/// Text under `NAME:` up to the next known section marker.
pub fn extract_section(text: &str, name: &str) -> Option<String> {
    let mut collecting = false;
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        match marker_at(line) {
            Some(marker) if marker == name => {
                collecting = true;
                // Content may follow the marker on the same line.
                if let Some((_, rest)) = line.split_once(':') {
                    if !rest.trim().is_empty() {
                        lines.push(rest.trim());
                    }
                }
            }
            Some(_) if collecting => break,
            _ if collecting => lines.push(line),
            _ => {}
        }
    }
    let joined = lines.join("\n").trim().to_string();
    (!joined.is_empty()).then_some(joined)
}

/// Bullet items under a `KEY_POINTS:` marker.
pub fn extract_key_points(text: &str) -> Vec<String> {
    extract_section(text, "KEY_POINTS")
        .map(|section| {
            section
                .lines()
                .map(strip_bullet)
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn strip_bullet(line: &str) -> String {
    let line = line.trim().trim_start_matches(['-', '*', '•']).trim_start();
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    let rest = &line[digits..];
    let line = if digits > 0 && (rest.starts_with('.') || rest.starts_with(')')) {
        &rest[1..]
    } else {
        line
    };
    line.trim().to_string()
}
