//! Tensor building blocks used by the reference kernels.

pub mod alibi;
pub mod mask;
pub mod ops;
pub mod rotary;

pub use alibi::{compute_alibi_slopes, AlibiSlopes};
pub use mask::attention_mask;
pub use ops::{repeat_kv, split_qkv};
pub use rotary::{RotaryEmbedding, RotaryStyle};
