//! Language-model capability for taskpilot.
//!
//! - [`llm`]: provider trait, Anthropic provider, mock provider, usage tracking
//! - [`gateway`]: [`ModelGateway`], the optional provider wrapped with timeout
//!   and cancellation
//! - [`structured`]: strict JSON contracts with heuristic fallback parsing

pub mod gateway;
pub mod llm;
pub mod structured;

pub use gateway::ModelGateway;
pub use llm::{
    AnthropicProvider, LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse, LlmRole,
    LlmUsageTracker, MockProvider, TextStream,
};
pub use structured::{extract_json, parse_structured, CompressionReply};
