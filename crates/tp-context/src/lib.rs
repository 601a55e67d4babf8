//! Workflow context accumulation and token-budgeted compression.

pub mod accumulator;
pub mod compressor;

pub use accumulator::{
    estimate_tokens, AccumulatorConfig, CleanupReport, CompressedContext, ContextAccumulator,
    ContextSnapshot, SnapshotKind, SnapshotMetadata, WorkflowContext,
};
pub use compressor::{AiContext, CompressorConfig, ContextCompressor, ContextPath};
