use candle_core::WithDType;
use tracing::debug;

use super::types::PhaseInputs;
use crate::beam::CacheIndirection;
use crate::error::{AttentionError, Result};
use crate::kernels::{AttentionKernels, AttentionSettings, GenerationParams};
use crate::kv_cache::KvCacheBuffer;
use crate::request::Request;
use crate::workspace::Workspace;

/// Single-token decode over the trailing generation requests of a batch.
pub(crate) struct GenerationExecutor<'e, K> {
    kernels: &'e K,
    settings: &'e AttentionSettings,
}

impl<'e, K: AttentionKernels> GenerationExecutor<'e, K> {
    pub fn new(kernels: &'e K, settings: &'e AttentionSettings) -> Self {
        Self { kernels, settings }
    }

    /// Run the generation slice. Its rows start at `first_row` of both the
    /// activations and the output; `cache` is narrowed to these sequences.
    pub fn execute<T: WithDType, B: KvCacheBuffer>(
        &self,
        requests: &[Request],
        first_row: usize,
        inputs: &PhaseInputs<'_>,
        cache_indirection: Option<&CacheIndirection>,
        cache: &B,
        workspace: &mut Workspace,
    ) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let batch_beam = requests.len();
        let beam_width = cache_indirection.map_or(1, CacheIndirection::beam_width);
        if batch_beam % beam_width != 0 {
            return Err(AttentionError::BeamWidthMismatch {
                batch_beam,
                beam_width,
            });
        }
        let num_requests = batch_beam / beam_width;
        let beams: Vec<usize> = requests.iter().map(|r| r.beam).collect();
        if let Some((slot, &beam)) = beams
            .iter()
            .enumerate()
            .find(|&(slot, &beam)| beam != slot % beam_width)
        {
            return Err(AttentionError::BatchContract(format!(
                "generation slot {slot} carries beam {beam}, expected {} for width {beam_width}",
                slot % beam_width
            )));
        }

        let sequence_lengths: Vec<usize> = requests.iter().map(|r| r.sequence_length).collect();
        let context_lengths: Vec<usize> = requests.iter().map(|r| r.context_length).collect();
        let past_kv_length = requests
            .iter()
            .map(|r| r.past_kv_length)
            .max()
            .unwrap_or(0);
        let max_seq_len = cache_indirection.map_or(cache.capacity(), CacheIndirection::max_seq_len);
        for &length in &sequence_lengths {
            if length > max_seq_len.min(cache.capacity()) {
                return Err(AttentionError::SequenceTooLong {
                    length,
                    max: max_seq_len.min(cache.capacity()),
                });
            }
        }
        if let Some(indir) = cache_indirection {
            if indir.batch() < num_requests {
                return Err(AttentionError::shape(
                    "cache_indirection batch",
                    format!(">= {num_requests}"),
                    indir.batch(),
                ));
            }
        }

        let qkv = inputs.qkv.narrow(0, first_row, batch_beam)?;
        let params = GenerationParams {
            settings: self.settings,
            qkv: &qkv,
            qkv_bias: inputs.qkv_bias,
            sequence_lengths: &sequence_lengths,
            context_lengths: &context_lengths,
            past_kv_length,
            beam_width,
            beams: &beams,
            num_requests,
            cache_indirection,
            scales: inputs.scales,
            alibi: inputs.alibi,
            cache,
            output: inputs.output,
            output_row_offset: first_row,
        };
        debug!(
            sequences = batch_beam,
            beam_width,
            past_kv_length,
            first_row,
            "generation phase"
        );
        self.kernels.generation_attention::<T, B>(&params, workspace)
    }
}
