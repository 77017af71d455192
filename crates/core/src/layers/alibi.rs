//! ALiBi (Attention with Linear Biases).
//!
//! Adds `m[h] * (j - i)` to the score of query position `i` against key
//! position `j`. Slopes follow the geometric schedule of the paper:
//!
//! ```text
//! base = 2^(-(2^(-(log2(n) - 3))))
//! m[h] = base^(h+1)  for h in 0..n
//! ```
//!
//! When `n` is not a power of two the remaining heads take odd powers of a
//! tighter base. Under tensor parallelism each rank owns a contiguous range
//! of the global heads and uses only those slopes.
//!
//! Reference: "Train Short, Test Long: Attention with Linear Biases Enables
//! Input Length Generalization" <https://arxiv.org/abs/2108.12409>

use candle_core::{DType, Device, Result, Tensor};

/// Slopes for all `num_heads` global heads.
pub fn compute_alibi_slopes(num_heads: usize) -> Vec<f32> {
    if num_heads == 0 {
        return Vec::new();
    }
    let closest_power_of_2 = 1usize << ((num_heads as f64).log2().floor() as u32);

    let exponent = -((closest_power_of_2 as f64).log2() - 3.0);
    let base = 2.0_f64.powf(-(2.0_f64.powf(exponent)));

    let mut slopes: Vec<f32> = (1..=closest_power_of_2)
        .map(|i| base.powi(i as i32) as f32)
        .collect();

    if closest_power_of_2 != num_heads {
        let extra_exponent = -((2 * closest_power_of_2) as f64).log2() + 3.0;
        let extra_base = 2.0_f64.powf(-(2.0_f64.powf(extra_exponent)));
        let remaining = (num_heads - closest_power_of_2).min(closest_power_of_2);
        slopes.extend((0..remaining).map(|i| extra_base.powi((1 + 2 * i) as i32) as f32));
    }

    slopes
}

/// Per-head ALiBi slopes of one tensor-parallel rank, kept in `f32`.
#[derive(Debug, Clone)]
pub struct AlibiSlopes {
    slopes: Tensor,
    num_heads: usize,
}

impl AlibiSlopes {
    /// Slopes for `local_heads` heads of rank `tp_rank` out of `tp_size`.
    pub fn for_rank(
        local_heads: usize,
        tp_size: usize,
        tp_rank: usize,
        device: &Device,
    ) -> Result<Self> {
        let all = compute_alibi_slopes(local_heads * tp_size);
        let start = tp_rank * local_heads;
        let local = all[start..start + local_heads].to_vec();
        Ok(Self {
            slopes: Tensor::from_vec(local, local_heads, device)?,
            num_heads: local_heads,
        })
    }

    /// Wrap caller-provided slopes (`[num_heads]`, any float dtype).
    pub fn from_tensor(slopes: &Tensor) -> Result<Self> {
        let num_heads = slopes.dims1()?;
        Ok(Self {
            slopes: slopes.to_dtype(DType::F32)?,
            num_heads,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn slopes(&self) -> &Tensor {
        &self.slopes
    }

    /// Bias `[num_heads, q_len, kv_len]` for queries at the last `q_len`
    /// positions of a `kv_len` history.
    pub fn bias(&self, q_len: usize, kv_len: usize) -> Result<Tensor> {
        let kv_offset = kv_len.saturating_sub(q_len);
        let distances: Vec<f32> = (0..q_len)
            .flat_map(|i| (0..kv_len).map(move |j| j as f32 - (kv_offset + i) as f32))
            .collect();
        let distances = Tensor::from_vec(distances, (1, q_len, kv_len), self.slopes.device())?;
        distances.broadcast_mul(&self.slopes.reshape((self.num_heads, 1, 1))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    #[test]
    fn slopes_known_values_8_heads() {
        let slopes = compute_alibi_slopes(8);
        let expected = [
            0.5, 0.25, 0.125, 0.0625, 0.03125, 0.015625, 0.0078125, 0.00390625,
        ];
        for (got, want) in slopes.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn slopes_non_power_of_two() {
        let slopes = compute_alibi_slopes(12);
        assert_eq!(slopes.len(), 12);
        assert!(slopes.iter().all(|&s| s > 0.0 && s < 1.0));
        assert!(compute_alibi_slopes(0).is_empty());
    }

    #[test]
    fn rank_slopes_are_a_slice_of_global() {
        let all = compute_alibi_slopes(8);
        let rank1 = AlibiSlopes::for_rank(4, 2, 1, &Device::Cpu).unwrap();
        let got: Vec<f32> = rank1.slopes().to_vec1().unwrap();
        assert_eq!(got, all[4..8].to_vec());
    }

    #[test]
    fn bias_is_relative_distance() {
        let slopes = AlibiSlopes::for_rank(2, 1, 0, &Device::Cpu).unwrap();
        let bias = slopes.bias(3, 3).unwrap();
        assert_eq!(bias.dims(), &[2, 3, 3]);
        // head 0 slope for two heads is 2^-4
        let row: Vec<f32> = bias.i((0, 2)).unwrap().to_vec1().unwrap();
        assert_eq!(row, vec![-2.0 / 16.0, -1.0 / 16.0, 0.0]);
    }

    #[test]
    fn decode_bias_uses_last_position() {
        let slopes = AlibiSlopes::from_tensor(
            &Tensor::new(&[1.0f32], &Device::Cpu).unwrap(),
        )
        .unwrap();
        let bias: Vec<f32> = slopes.bias(1, 4).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(bias, vec![-3.0, -2.0, -1.0, 0.0]);
    }
}
