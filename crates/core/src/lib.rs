//! Batched attention dispatch over mixed context and generation requests.
//!
//! A batch holds prefill requests followed by decode requests. The
//! [`AttentionDispatchEngine`] splits it at the phase boundary, resolves the
//! activation precision and KV cache layout to concrete types, and hands each
//! slice to an [`AttentionKernels`] implementation that writes the attention
//! output and appends to the KV cache in place.

pub mod beam;
pub mod config;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod kv_cache;
pub mod layers;
pub mod request;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use beam::CacheIndirection;
pub use config::{AttentionConfig, CacheLayout, DispatchKey, Precision, TokenLayout};
pub use engine::{
    AttentionDispatchEngine, BatchInputs, BatchOutputs, BatchPartition, BatchPartitioner,
    KvCacheInput,
};
pub use error::{AttentionError, ErrorKind, Result};
pub use kernels::{AttentionKernels, ReferenceKernels};
pub use request::{BatchDescriptor, Request, RequestPhase};
pub use workspace::{Workspace, WorkspaceSizer};
