use candle_core::{DType, Device, Result, Tensor};

use crate::config::{PositionEmbedding, RotaryConfig, RotaryScaling};

/// Pairing convention of the rotated dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotaryStyle {
    /// Adjacent pairs `(x0, x1), (x2, x3), ...`.
    GptJ,
    /// Halves `(x0, x_{d/2}), (x1, x_{d/2+1}), ...`.
    GptNeox,
}

impl RotaryStyle {
    pub fn from_embedding(embedding: PositionEmbedding) -> Option<Self> {
        match embedding {
            PositionEmbedding::RopeGptj => Some(RotaryStyle::GptJ),
            PositionEmbedding::RopeGptNeox => Some(RotaryStyle::GptNeox),
            _ => None,
        }
    }
}

/// Rotary position embedding over the first `rot_dim` dimensions of a head.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    style: RotaryStyle,
    rot_dim: usize,
    base: f64,
    scaling: RotaryScaling,
    scale: f64,
    max_positions: usize,
}

impl RotaryEmbedding {
    pub fn new(config: &RotaryConfig, style: RotaryStyle, head_size: usize) -> Self {
        let rot_dim = if config.dim == 0 { head_size } else { config.dim };
        Self {
            style,
            rot_dim,
            base: config.base as f64,
            scaling: config.scaling,
            scale: config.scale as f64,
            max_positions: config.max_positions,
        }
    }

    pub fn rot_dim(&self) -> usize {
        self.rot_dim
    }

    /// Base after NTK stretching for a sequence of `seq_len` tokens.
    fn effective_base(&self, seq_len: usize) -> f64 {
        if self.scaling != RotaryScaling::Dynamic || seq_len <= self.max_positions {
            return self.base;
        }
        let d = self.rot_dim as f64;
        let factor = self.scale * seq_len as f64 / self.max_positions as f64 - (self.scale - 1.0);
        self.base * factor.powf(d / (d - 2.0))
    }

    /// `cos`, `sin` tables `[positions, rot_dim / 2]` in `f32`.
    fn tables(&self, positions: &[usize], seq_len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let base = self.effective_base(seq_len);
        let half = self.rot_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| (1.0 / base.powf((2 * i) as f64 / self.rot_dim as f64)) as f32)
            .collect();
        let pos_scale = match self.scaling {
            RotaryScaling::Linear => 1.0 / self.scale as f32,
            _ => 1.0,
        };
        let pos: Vec<f32> = positions.iter().map(|&p| p as f32 * pos_scale).collect();
        let pos = Tensor::from_vec(pos, (positions.len(), 1), device)?;
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let freqs = pos.matmul(&inv_freq)?;
        Ok((freqs.cos()?, freqs.sin()?))
    }

    /// Rotate `x` (`[tokens, heads, head_size]`) where token `t` sits at
    /// `positions[t]` of a sequence of `seq_len` tokens. Output is `f32`.
    pub fn apply(&self, x: &Tensor, positions: &[usize], seq_len: usize) -> Result<Tensor> {
        let (tokens, _heads, head_size) = x.dims3()?;
        let x = x.to_dtype(DType::F32)?;
        if tokens == 0 || self.rot_dim == 0 {
            return Ok(x);
        }
        let (cos, sin) = self.tables(positions, seq_len, x.device())?;

        // rope kernels expect [b, h, t, d]
        let rot = x
            .narrow(2, 0, self.rot_dim)?
            .transpose(0, 1)?
            .unsqueeze(0)?
            .contiguous()?;
        let rotated = match self.style {
            RotaryStyle::GptJ => candle_nn::rotary_emb::rope_i(&rot, &cos, &sin)?,
            RotaryStyle::GptNeox => candle_nn::rotary_emb::rope(&rot, &cos, &sin)?,
        };
        let rotated = rotated.squeeze(0)?.transpose(0, 1)?;
        if self.rot_dim == head_size {
            return rotated.contiguous();
        }
        let pass = x.narrow(2, self.rot_dim, head_size - self.rot_dim)?;
        Tensor::cat(&[&rotated, &pass], 2)?.contiguous()
    }
}
