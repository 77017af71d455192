use candle_core::{DType, Device, Result, Tensor};

use crate::config::MaskType;

/// Additive mask `[q_len, kv_len]` in `f32`.
///
/// Queries occupy the last `q_len` positions of the `kv_len` history. Causal
/// masks hide keys after the query position with `-inf`; bidirectional masks
/// are all zeros.
pub fn attention_mask(
    mask_type: MaskType,
    q_len: usize,
    kv_len: usize,
    device: &Device,
) -> Result<Tensor> {
    match mask_type {
        MaskType::Bidirectional => Tensor::zeros((q_len, kv_len), DType::F32, device),
        MaskType::Causal => {
            let offset = kv_len.saturating_sub(q_len);
            let mask: Vec<f32> = (0..q_len)
                .flat_map(|i| {
                    (0..kv_len).map(move |j| {
                        if j > i + offset {
                            f32::NEG_INFINITY
                        } else {
                            0.0
                        }
                    })
                })
                .collect();
            Tensor::from_vec(mask, (q_len, kv_len), device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_hides_future() {
        let mask: Vec<Vec<f32>> = attention_mask(MaskType::Causal, 3, 3, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(mask[0][0], 0.0);
        assert_eq!(mask[0][1], f32::NEG_INFINITY);
        assert_eq!(mask[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn causal_with_history_offset() {
        let mask: Vec<Vec<f32>> = attention_mask(MaskType::Causal, 1, 5, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!(mask[0].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn bidirectional_is_zero() {
        let mask = attention_mask(MaskType::Bidirectional, 4, 4, &Device::Cpu).unwrap();
        let sum: f32 = mask.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }
}
