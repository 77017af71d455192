//! KV cache quantization.
//!
//! When the cache stores a narrower type than the activations, every write
//! is rescaled by `orig_quant` and every read by `quant_orig`:
//! - **INT8**: symmetric, clamped to ±127 and stored shifted by +128 as `U8`
//! - **FP8 E4M3**: 1 sign, 4 exponent, 3 mantissa bits, range ±448, stored as its raw byte
//!
//! Scales are per-tensor scalars owned by the caller.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// KV cache storage mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheQuantMode {
    /// Store K/V in the activation precision.
    #[default]
    None,
    Int8,
    Fp8,
}

impl KvCacheQuantMode {
    /// Storage element size in bytes.
    pub fn element_size(&self, compute_dtype: DType) -> usize {
        match self {
            KvCacheQuantMode::None => compute_dtype.size_in_bytes(),
            KvCacheQuantMode::Int8 | KvCacheQuantMode::Fp8 => 1,
        }
    }

    pub fn storage_dtype(&self, compute_dtype: DType) -> DType {
        match self {
            KvCacheQuantMode::None => compute_dtype,
            KvCacheQuantMode::Int8 | KvCacheQuantMode::Fp8 => DType::U8,
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, KvCacheQuantMode::None)
    }

    /// Largest magnitude representable after scaling.
    pub fn max_representable(&self) -> f32 {
        match self {
            KvCacheQuantMode::None => f32::MAX,
            KvCacheQuantMode::Int8 => INT8_MAX,
            KvCacheQuantMode::Fp8 => FP8_E4M3_MAX,
        }
    }
}

/// Per-tensor scale pair for a quantized cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationScales {
    /// Multiplier applied before storing: `q = x * orig_quant`.
    pub orig_quant: f32,
    /// Multiplier applied after loading: `x = q * quant_orig`.
    pub quant_orig: f32,
}

impl QuantizationScales {
    pub fn new(orig_quant: f32, quant_orig: f32) -> Self {
        Self {
            orig_quant,
            quant_orig,
        }
    }

    /// Scales that map `[-amax, amax]` onto the full range of `mode`.
    pub fn from_amax(amax: f32, mode: KvCacheQuantMode) -> Self {
        if !mode.is_quantized() {
            return Self::identity();
        }
        let amax = amax.max(SCALE_MIN);
        let orig_quant = mode.max_representable() / amax;
        Self {
            orig_quant,
            quant_orig: 1.0 / orig_quant,
        }
    }

    pub fn identity() -> Self {
        Self::new(1.0, 1.0)
    }

    pub fn is_valid(&self) -> bool {
        self.orig_quant.is_finite()
            && self.quant_orig.is_finite()
            && self.orig_quant > 0.0
            && self.quant_orig > 0.0
    }
}

const INT8_MAX: f32 = 127.0;

/// Maximum representable value in FP8 E4M3 format.
const FP8_E4M3_MAX: f32 = 448.0;

/// Minimum amax to avoid division by zero.
const SCALE_MIN: f32 = 1e-12;

/// Convert activations into cache storage. Unquantized modes only cast.
pub fn quantize(
    tensor: &Tensor,
    mode: KvCacheQuantMode,
    scales: &QuantizationScales,
    storage_dtype: DType,
) -> Result<Tensor> {
    match mode {
        KvCacheQuantMode::None => tensor.to_dtype(storage_dtype),
        KvCacheQuantMode::Int8 => quantize_int8(tensor, scales.orig_quant),
        KvCacheQuantMode::Fp8 => quantize_fp8(tensor, scales.orig_quant),
    }
}

/// Convert cache storage back into `target_dtype`.
pub fn dequantize(
    tensor: &Tensor,
    mode: KvCacheQuantMode,
    scales: &QuantizationScales,
    target_dtype: DType,
) -> Result<Tensor> {
    match mode {
        KvCacheQuantMode::None => tensor.to_dtype(target_dtype),
        KvCacheQuantMode::Int8 => dequantize_int8(tensor, scales.quant_orig, target_dtype),
        KvCacheQuantMode::Fp8 => dequantize_fp8(tensor, scales.quant_orig, target_dtype),
    }
}

/// Quantize to INT8, stored shifted to unsigned (`q + 128`).
pub fn quantize_int8(tensor: &Tensor, orig_quant: f32) -> Result<Tensor> {
    let scaled = (tensor.to_dtype(DType::F32)? * orig_quant as f64)?;
    let clamped = scaled.round()?.clamp(-INT8_MAX, INT8_MAX)?;
    (clamped + 128.0)?.to_dtype(DType::U8)
}

pub fn dequantize_int8(tensor: &Tensor, quant_orig: f32, target_dtype: DType) -> Result<Tensor> {
    let signed = (tensor.to_dtype(DType::F32)? - 128.0)?;
    (signed * quant_orig as f64)?.to_dtype(target_dtype)
}

pub fn quantize_fp8(tensor: &Tensor, orig_quant: f32) -> Result<Tensor> {
    let shape = tensor.dims().to_vec();
    let data: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let encoded: Vec<u8> = data
        .iter()
        .map(|&v| fp8_e4m3_encode(v * orig_quant))
        .collect();
    Tensor::from_vec(encoded, shape, tensor.device())
}

pub fn dequantize_fp8(tensor: &Tensor, quant_orig: f32, target_dtype: DType) -> Result<Tensor> {
    let shape = tensor.dims().to_vec();
    let data: Vec<u8> = tensor.flatten_all()?.to_vec1()?;
    let decoded: Vec<f32> = data
        .iter()
        .map(|&b| fp8_e4m3_decode(b) * quant_orig)
        .collect();
    Tensor::from_vec(decoded, shape, tensor.device())?.to_dtype(target_dtype)
}

/// Encode to FP8 E4M3 with round-to-nearest, saturating at ±448.
fn fp8_e4m3_encode(val: f32) -> u8 {
    if val.is_nan() {
        return 0x7F;
    }
    let sign = if val.is_sign_negative() { 0x80u8 } else { 0u8 };
    let abs_val = val.abs().min(FP8_E4M3_MAX);

    // Subnormal range: value = mant * 2^-9
    if abs_val < 2.0f32.powi(-6) {
        let mant = (abs_val * 512.0).round() as u8;
        return if mant >= 8 { sign | 0x08 } else { sign | mant };
    }

    let bits = abs_val.to_bits();
    let mut exp = ((bits >> 23) & 0xFF) as i32 - 127 + 7;
    let mut mant = ((bits & 0x7F_FFFF) + (1 << 19)) >> 20;
    if mant == 8 {
        mant = 0;
        exp += 1;
    }
    // exp 15 / mant 7 is NaN in E4M3
    if exp > 15 || (exp == 15 && mant == 7) {
        return sign | 0x7E;
    }
    sign | ((exp as u8) << 3) | mant as u8
}

fn fp8_e4m3_decode(byte: u8) -> f32 {
    let sign = if (byte & 0x80) != 0 { -1.0f32 } else { 1.0f32 };
    let exp = ((byte >> 3) & 0x0F) as i32;
    let mant = (byte & 0x07) as f32;

    if exp == 15 && mant == 7.0 {
        f32::NAN
    } else if exp == 0 {
        sign * (mant / 8.0) * 2.0f32.powi(-6)
    } else {
        sign * 2.0f32.powi(exp - 7) * (1.0 + mant / 8.0)
    }
}
