//! Error types for the attention dispatch engine.
//!
//! Every failure is fatal for the invocation that raised it; there are no
//! retries. [`AttentionError::kind`] classifies an error into the four
//! categories callers act on.

use candle_core::DType;
use thiserror::Error;

use crate::kv_cache::CacheError;
use crate::request::RequestPhase;

pub type Result<T> = std::result::Result<T, AttentionError>;

/// Coarse classification used by callers to decide what to tear down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad engine configuration, detected before any invocation runs.
    Configuration,
    /// The batch violates a dispatch invariant; the invocation is aborted.
    BatchContract,
    /// Wrong rank, dtype, device or element count at the boundary.
    Format,
    /// Failure inside a numeric kernel or cache access.
    Kernel,
}

#[derive(Debug, Error)]
pub enum AttentionError {
    #[error("invalid configuration '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("engine is not configured: call configure() with the KV cache shape first")]
    NotConfigured,

    #[error("request {index} is tagged {found:?} after generation requests started")]
    PhaseInterleaved { index: usize, found: RequestPhase },

    #[error("mixed context/generation batch requires a paged cache and packed tokens (cache: {cache}, tokens: {layout})")]
    MixedBatchUnsupported {
        cache: &'static str,
        layout: &'static str,
    },

    #[error("generation slice of {batch_beam} sequences is not divisible by beam width {beam_width}")]
    BeamWidthMismatch { batch_beam: usize, beam_width: usize },

    #[error("context length {length} exceeds configured maximum {max}")]
    ContextTooLong { length: usize, max: usize },

    #[error("sequence length {length} exceeds cache capacity {max}")]
    SequenceTooLong { length: usize, max: usize },

    #[error("batch contract violation: {0}")]
    BatchContract(String),

    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    #[error("dtype mismatch for {what}: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        what: &'static str,
        expected: DType,
        got: DType,
    },

    #[error("workspace too small: required {required} bytes, provided {provided}")]
    WorkspaceTooSmall { required: usize, provided: usize },

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl AttentionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. } | Self::NotConfigured => ErrorKind::Configuration,
            Self::PhaseInterleaved { .. }
            | Self::MixedBatchUnsupported { .. }
            | Self::BeamWidthMismatch { .. }
            | Self::ContextTooLong { .. }
            | Self::SequenceTooLong { .. }
            | Self::BatchContract(_) => ErrorKind::BatchContract,
            Self::ShapeMismatch { .. }
            | Self::DTypeMismatch { .. }
            | Self::WorkspaceTooSmall { .. } => ErrorKind::Format,
            Self::Cache(_) | Self::Candle(_) => ErrorKind::Kernel,
        }
    }

    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(what: &'static str, expected: impl ToString, got: impl ToString) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}
