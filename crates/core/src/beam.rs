use crate::error::{AttentionError, Result};

/// Beam-search cache indirection `[batch, beam_width, max_seq_len]`.
///
/// Entry `(r, b, p)` names the beam of request `r` whose history holds
/// position `p` for beam `b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheIndirection {
    data: Vec<i32>,
    batch: usize,
    beam_width: usize,
    max_seq_len: usize,
}

impl CacheIndirection {
    pub fn new(data: Vec<i32>, batch: usize, beam_width: usize, max_seq_len: usize) -> Result<Self> {
        if beam_width == 0 || max_seq_len == 0 {
            return Err(AttentionError::shape(
                "cache_indirection",
                "positive beam width and max_seq_len",
                format!("[{batch}, {beam_width}, {max_seq_len}]"),
            ));
        }
        let expected = batch * beam_width * max_seq_len;
        if data.len() != expected {
            return Err(AttentionError::shape("cache_indirection", expected, data.len()));
        }
        Ok(Self {
            data,
            batch,
            beam_width,
            max_seq_len,
        })
    }

    /// Every beam reads its own history.
    pub fn identity(batch: usize, beam_width: usize, max_seq_len: usize) -> Self {
        let data = (0..batch)
            .flat_map(|_| (0..beam_width).flat_map(move |b| std::iter::repeat(b as i32).take(max_seq_len)))
            .collect();
        Self {
            data,
            batch,
            beam_width,
            max_seq_len,
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.batch, self.beam_width, self.max_seq_len]
    }

    pub fn set(&mut self, request: usize, beam: usize, pos: usize, source: usize) -> Result<()> {
        let idx = self.index(request, beam, pos)?;
        self.data[idx] = source as i32;
        Ok(())
    }

    fn index(&self, request: usize, beam: usize, pos: usize) -> Result<usize> {
        if request >= self.batch || beam >= self.beam_width || pos >= self.max_seq_len {
            return Err(AttentionError::shape(
                "cache_indirection index",
                format!("< [{}, {}, {}]", self.batch, self.beam_width, self.max_seq_len),
                format!("({request}, {beam}, {pos})"),
            ));
        }
        Ok((request * self.beam_width + beam) * self.max_seq_len + pos)
    }

    /// Source beam for `(request, beam, pos)`.
    pub fn source_beam(&self, request: usize, beam: usize, pos: usize) -> Result<usize> {
        let raw = self.data[self.index(request, beam, pos)?];
        usize::try_from(raw)
            .ok()
            .filter(|&b| b < self.beam_width)
            .ok_or_else(|| {
                AttentionError::BatchContract(format!(
                    "cache indirection ({request}, {beam}, {pos}) names beam {raw} of {}",
                    self.beam_width
                ))
            })
    }
}
