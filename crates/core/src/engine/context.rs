use candle_core::WithDType;
use tracing::debug;

use super::types::PhaseInputs;
use crate::config::AttentionConfig;
use crate::error::{AttentionError, Result};
use crate::kernels::{AttentionKernels, AttentionSettings, ContextParams};
use crate::kv_cache::KvCacheBuffer;
use crate::request::Request;
use crate::workspace::Workspace;

/// Prefill over the leading context requests of a batch.
pub(crate) struct ContextExecutor<'e, K> {
    kernels: &'e K,
    config: &'e AttentionConfig,
    settings: &'e AttentionSettings,
}

impl<'e, K: AttentionKernels> ContextExecutor<'e, K> {
    pub fn new(kernels: &'e K, config: &'e AttentionConfig, settings: &'e AttentionSettings) -> Self {
        Self {
            kernels,
            config,
            settings,
        }
    }

    /// Run the context slice. `cache` is already narrowed to these requests;
    /// their activation rows start at row 0 of `inputs.qkv`.
    pub fn execute<T: WithDType, B: KvCacheBuffer>(
        &self,
        requests: &[Request],
        padded_seq_len: Option<usize>,
        inputs: &PhaseInputs<'_>,
        cache: &B,
        workspace: &mut Workspace,
    ) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let context_lengths: Vec<usize> = requests.iter().map(|r| r.context_length).collect();
        for &length in &context_lengths {
            if length > self.config.max_context_length {
                return Err(AttentionError::ContextTooLong {
                    length,
                    max: self.config.max_context_length,
                });
            }
            if length > cache.capacity() {
                return Err(AttentionError::SequenceTooLong {
                    length,
                    max: cache.capacity(),
                });
            }
            if let Some(seq) = padded_seq_len {
                if length > seq {
                    return Err(AttentionError::BatchContract(format!(
                        "context length {length} exceeds padded sequence length {seq}"
                    )));
                }
            }
        }

        let (row_offsets, rows, max_context_length) = match padded_seq_len {
            Some(seq) => (
                (0..requests.len()).map(|i| i * seq).collect::<Vec<_>>(),
                requests.len() * seq,
                seq,
            ),
            None => {
                let mut offsets = Vec::with_capacity(requests.len());
                let mut total = 0;
                for &length in &context_lengths {
                    offsets.push(total);
                    total += length;
                }
                let max = context_lengths.iter().copied().max().unwrap_or(0);
                (offsets, total, max)
            }
        };
        // Kernels need at least one row per sequence to size their scratch.
        let max_context_length = max_context_length.max(1);

        let qkv = inputs.qkv.narrow(0, 0, rows)?;
        let params = ContextParams {
            settings: self.settings,
            qkv: &qkv,
            qkv_bias: inputs.qkv_bias,
            context_lengths: &context_lengths,
            row_offsets: &row_offsets,
            padded_rows: padded_seq_len,
            max_context_length,
            scales: inputs.scales,
            alibi: inputs.alibi,
            cache,
            output: inputs.output,
            output_row_offset: 0,
        };
        debug!(
            requests = requests.len(),
            rows,
            max_context_length,
            "context phase"
        );
        self.kernels.context_attention::<T, B>(&params, workspace)
    }
}
