use candle_core::{DType, Tensor, WithDType};
use candle_nn::ops::softmax_last_dim;
use tracing::trace;

use super::{AlibiPlacement, AttentionKernels, AttentionSettings, ContextParams, GenerationParams};
use crate::config::MaskType;
use crate::error::{AttentionError, Result};
use crate::kv_cache::quantization::{dequantize, quantize};
use crate::kv_cache::{KvCacheBuffer, KvHalf, QuantizationScales};
use crate::layers::{attention_mask, repeat_kv, split_qkv, AlibiSlopes};
use crate::workspace::{Workspace, MULTI_BLOCK_TILE};

/// Attention kernels built from candle tensor ops.
///
/// Math runs in `f32`; results are cast to the activation type on write.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernels;

impl ReferenceKernels {
    pub fn new() -> Self {
        Self
    }
}

fn check_dtype<T: WithDType>(what: &'static str, tensor: &Tensor) -> Result<()> {
    if tensor.dtype() != T::DTYPE {
        return Err(AttentionError::DTypeMismatch {
            what,
            expected: T::DTYPE,
            got: tensor.dtype(),
        });
    }
    Ok(())
}

/// Rows `start..start + len` of the fused QKV input with the bias applied.
fn load_rows(qkv: &Tensor, bias: Option<&Tensor>, start: usize, len: usize) -> Result<Tensor> {
    let rows = qkv.narrow(0, start, len)?.to_dtype(DType::F32)?;
    Ok(match bias {
        Some(bias) => rows.broadcast_add(&bias.to_dtype(DType::F32)?)?,
        None => rows,
    })
}

/// `[tokens, heads, d]` -> `[num_heads, tokens, d]`, repeating KV heads for GQA.
fn to_heads(x: &Tensor, groups: usize) -> Result<Tensor> {
    let x = x.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
    Ok(repeat_kv(x, groups)?.squeeze(0)?.contiguous()?)
}

/// Scaled scores `[num_heads, q_len, kv_len]` with ALiBi and the mask applied.
fn scores(
    settings: &AttentionSettings,
    q: &Tensor,
    k: &Tensor,
    alibi: Option<&AlibiSlopes>,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let (_, q_len, _) = q.dims3()?;
    let kv_len = k.dim(1)?;
    let raw = q.matmul(&k.t()?.contiguous()?)?;
    let scale = settings.softmax_scale as f64;
    let scored = match (settings.alibi, alibi) {
        (Some(AlibiPlacement::BeforeScale), Some(slopes)) => {
            (raw.add(&slopes.bias(q_len, kv_len)?)? * scale)?
        }
        (Some(AlibiPlacement::AfterScale), Some(slopes)) => {
            (raw * scale)?.add(&slopes.bias(q_len, kv_len)?)?
        }
        _ => (raw * scale)?,
    };
    Ok(match mask {
        Some(mask) => scored.broadcast_add(mask)?,
        None => scored,
    })
}

/// Softmax over history tiles combined through their running max and sum.
fn tiled_softmax_pv(scores: &Tensor, v: &Tensor, tile: usize) -> Result<(Tensor, usize)> {
    let kv_len = scores.dim(2)?;
    let mut parts = Vec::with_capacity(kv_len.div_ceil(tile));
    for start in (0..kv_len).step_by(tile) {
        let len = tile.min(kv_len - start);
        let s = scores.narrow(2, start, len)?;
        let m = s.max_keepdim(2)?;
        let p = s.broadcast_sub(&m)?.exp()?;
        let l = p.sum_keepdim(2)?;
        let o = p.matmul(&v.narrow(1, start, len)?.contiguous()?)?;
        parts.push((m, l, o));
    }
    let mut global = parts[0].0.clone();
    for (m, _, _) in &parts[1..] {
        global = global.maximum(m)?;
    }
    let mut num: Option<Tensor> = None;
    let mut den: Option<Tensor> = None;
    for (m, l, o) in &parts {
        let w = m.broadcast_sub(&global)?.exp()?;
        let o = o.broadcast_mul(&w)?;
        let l = l.mul(&w)?;
        num = Some(match num {
            Some(acc) => acc.add(&o)?,
            None => o,
        });
        den = Some(match den {
            Some(acc) => acc.add(&l)?,
            None => l,
        });
    }
    match (num, den) {
        (Some(num), Some(den)) => Ok((num.broadcast_div(&den)?, parts.len())),
        _ => Err(AttentionError::BatchContract("empty attention history".into())),
    }
}

/// `[num_heads, q_len, d]` -> `[q_len, num_heads * d]`
fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (heads, q_len, d) = x.dims3()?;
    Ok(x.transpose(0, 1)?.contiguous()?.reshape((q_len, heads * d))?)
}

fn write_rows(output: &Tensor, rows: &Tensor, offset: usize) -> Result<()> {
    let rows = rows.to_dtype(output.dtype())?.contiguous()?;
    output.slice_set(&rows, 0, offset)?;
    Ok(())
}

fn scales_or_identity(scales: Option<QuantizationScales>) -> QuantizationScales {
    scales.unwrap_or_else(QuantizationScales::identity)
}

impl AttentionKernels for ReferenceKernels {
    fn context_attention<T: WithDType, B: KvCacheBuffer>(
        &self,
        p: &ContextParams<'_, B>,
        workspace: &mut Workspace,
    ) -> Result<()> {
        check_dtype::<T>("context qkv", p.qkv)?;
        check_dtype::<T>("attention output", p.output)?;
        let s = p.settings;
        let batch = p.batch_size();
        let layout =
            self.context_workspace(&s.geometry, s.precision, batch, p.max_context_length);
        let mut regions = workspace.carve(&layout)?;

        let mut cu_seqlens = Vec::with_capacity(batch + 1);
        cu_seqlens.push(0i32);
        let mut padding_offset = Vec::new();
        for (i, &len) in p.context_lengths.iter().enumerate() {
            let before = *cu_seqlens.last().unwrap_or(&0);
            padding_offset.extend(std::iter::repeat((i * p.max_context_length) as i32 - before).take(len));
            cu_seqlens.push(before + len as i32);
        }
        regions.write_i32s("cu_seqlens", &cu_seqlens)?;
        regions.write_i32s("padding_offset", &padding_offset)?;

        let scales = scales_or_identity(p.scales);
        let out_hidden = s.num_heads * s.head_size;
        for (i, (&len, &row)) in p.context_lengths.iter().zip(p.row_offsets).enumerate() {
            let span = p.padded_rows.unwrap_or(len);
            if len == 0 {
                if span > 0 {
                    let zeros = Tensor::zeros((span, out_hidden), DType::F32, p.output.device())?;
                    write_rows(p.output, &zeros, p.output_row_offset + row)?;
                }
                continue;
            }
            let rows = load_rows(p.qkv, p.qkv_bias, row, len)?;
            let (q, k, v) = split_qkv(&rows, s.num_heads, s.num_kv_heads, s.head_size)?;
            let (q, k) = match &s.rotary {
                Some(rope) => {
                    let positions: Vec<usize> = (0..len).collect();
                    (
                        rope.apply(&q, &positions, len)?,
                        rope.apply(&k, &positions, len)?,
                    )
                }
                None => (q, k),
            };

            let k_store = quantize(&k, s.kv_cache_quant, &scales, p.cache.dtype())?;
            let v_store = quantize(&v, s.kv_cache_quant, &scales, p.cache.dtype())?;
            p.cache.write(i, KvHalf::Key, 0, &k_store)?;
            p.cache.write(i, KvHalf::Value, 0, &v_store)?;

            let groups = s.num_kv_groups();
            let q = q.transpose(0, 1)?.contiguous()?;
            let k = to_heads(&k, groups)?;
            let v = to_heads(&v, groups)?;
            let mask = match s.mask_type {
                MaskType::Causal => Some(attention_mask(s.mask_type, len, len, q.device())?),
                MaskType::Bidirectional => None,
            };
            let scores = scores(s, &q, &k, p.alibi, mask.as_ref())?;
            let probs = softmax_last_dim(&scores)?;
            let mut out = merge_heads(&probs.matmul(&v)?)?;
            if span > len {
                let pad = Tensor::zeros((span - len, out_hidden), DType::F32, out.device())?;
                out = Tensor::cat(&[&out, &pad], 0)?;
            }
            write_rows(p.output, &out, p.output_row_offset + row)?;
            trace!(request = i, len, row, "context attention");
        }
        Ok(())
    }

    fn generation_attention<T: WithDType, B: KvCacheBuffer>(
        &self,
        p: &GenerationParams<'_, B>,
        workspace: &mut Workspace,
    ) -> Result<()> {
        check_dtype::<T>("generation qkv", p.qkv)?;
        check_dtype::<T>("attention output", p.output)?;
        let s = p.settings;
        let batch_beam = p.batch_beam();
        let layout = self.generation_workspace(&s.geometry, s.precision, batch_beam);
        let mut regions = workspace.carve(&layout)?;
        let multi_block = s.geometry.multi_block_mode;
        let mut tiles_used = Vec::new();

        let scales = scales_or_identity(p.scales);
        let groups = s.num_kv_groups();
        for seq in 0..batch_beam {
            let seq_len = p.sequence_lengths[seq];
            if seq_len == 0 || seq_len > p.past_kv_length + 1 {
                return Err(AttentionError::BatchContract(format!(
                    "sequence {seq} has length {seq_len} with past_kv_length {}",
                    p.past_kv_length
                )));
            }
            let t = seq_len - 1;
            let rows = load_rows(p.qkv, p.qkv_bias, seq, 1)?;
            let (q, k, v) = split_qkv(&rows, s.num_heads, s.num_kv_heads, s.head_size)?;
            let (q, k) = match &s.rotary {
                Some(rope) => (rope.apply(&q, &[t], seq_len)?, rope.apply(&k, &[t], seq_len)?),
                None => (q, k),
            };

            p.cache.write(
                seq,
                KvHalf::Key,
                t,
                &quantize(&k, s.kv_cache_quant, &scales, p.cache.dtype())?,
            )?;
            p.cache.write(
                seq,
                KvHalf::Value,
                t,
                &quantize(&v, s.kv_cache_quant, &scales, p.cache.dtype())?,
            )?;

            let request = seq / p.beam_width;
            let beam = p.beams[seq];
            let coords = (0..t)
                .map(|pos| {
                    let source = match p.cache_indirection {
                        Some(indir) => request * p.beam_width + indir.source_beam(request, beam, pos)?,
                        None => seq,
                    };
                    Ok((source, pos))
                })
                .collect::<Result<Vec<_>>>()?;
            let (k_all, v_all) = if coords.is_empty() {
                (k, v)
            } else {
                let k_past = dequantize(
                    &p.cache.gather(KvHalf::Key, &coords)?,
                    s.kv_cache_quant,
                    &scales,
                    DType::F32,
                )?;
                let v_past = dequantize(
                    &p.cache.gather(KvHalf::Value, &coords)?,
                    s.kv_cache_quant,
                    &scales,
                    DType::F32,
                )?;
                (
                    Tensor::cat(&[&k_past, &k], 0)?,
                    Tensor::cat(&[&v_past, &v], 0)?,
                )
            };

            let q = q.transpose(0, 1)?.contiguous()?;
            let k_all = to_heads(&k_all, groups)?;
            let v_all = to_heads(&v_all, groups)?;
            let scores = scores(s, &q, &k_all, p.alibi, None)?;
            let out = if multi_block {
                let (out, tiles) = tiled_softmax_pv(&scores, &v_all, MULTI_BLOCK_TILE)?;
                tiles_used.extend(std::iter::repeat(tiles as i32).take(s.num_heads));
                out
            } else {
                softmax_last_dim(&scores)?.matmul(&v_all)?
            };
            write_rows(p.output, &merge_heads(&out)?, p.output_row_offset + seq)?;
        }
        if multi_block {
            regions.write_i32s("block_counter", &tiles_used)?;
        }
        Ok(())
    }
}
