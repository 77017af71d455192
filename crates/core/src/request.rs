use serde::{Deserialize, Serialize};

use crate::error::{AttentionError, Result};

/// Phase tag of one request in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    /// Prefill: the whole prompt is processed in this call.
    Context,
    /// Decode: exactly one new token against the accumulated history.
    Generation,
}

/// Integer tag used by host runtimes: `0` context, `1` generation.
impl TryFrom<i32> for RequestPhase {
    type Error = AttentionError;

    fn try_from(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(RequestPhase::Context),
            1 => Ok(RequestPhase::Generation),
            other => Err(AttentionError::shape("request type tag", "0 or 1", other)),
        }
    }
}

/// One sequence in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub phase: RequestPhase,
    /// Prompt length.
    pub context_length: usize,
    /// Tokens of this sequence once the current call completes.
    pub sequence_length: usize,
    /// Tokens already present in the KV cache before this call.
    pub past_kv_length: usize,
    /// Beam index inside the owning request group (0 without beam search).
    /// Generation slot `i` must carry `i % beam_width`.
    pub beam: usize,
}

impl Request {
    pub fn context(prompt_len: usize) -> Self {
        Self {
            phase: RequestPhase::Context,
            context_length: prompt_len,
            sequence_length: prompt_len,
            past_kv_length: 0,
            beam: 0,
        }
    }

    /// A decode step for a sequence that already holds `past_kv_length` tokens.
    pub fn generation(context_length: usize, past_kv_length: usize) -> Self {
        Self {
            phase: RequestPhase::Generation,
            context_length,
            sequence_length: past_kv_length + 1,
            past_kv_length,
            beam: 0,
        }
    }
}

/// Ordered requests of a single invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDescriptor {
    requests: Vec<Request>,
}

impl BatchDescriptor {
    pub fn new(requests: Vec<Request>) -> Self {
        Self { requests }
    }

    /// Build from the per-request vectors a host runtime hands over.
    pub fn from_host(
        request_types: &[i32],
        context_lengths: &[i32],
        sequence_lengths: &[i32],
        past_kv_lengths: &[i32],
    ) -> Result<Self> {
        let n = request_types.len();
        for (what, len) in [
            ("context_lengths", context_lengths.len()),
            ("sequence_lengths", sequence_lengths.len()),
            ("past_kv_lengths", past_kv_lengths.len()),
        ] {
            if len != n {
                return Err(AttentionError::shape(what, n, len));
            }
        }
        let non_negative = |what: &'static str, v: i32| -> Result<usize> {
            usize::try_from(v).map_err(|_| AttentionError::shape(what, ">= 0", v))
        };
        let requests = (0..n)
            .map(|i| {
                Ok(Request {
                    phase: RequestPhase::try_from(request_types[i])?,
                    context_length: non_negative("context_lengths", context_lengths[i])?,
                    sequence_length: non_negative("sequence_lengths", sequence_lengths[i])?,
                    past_kv_length: non_negative("past_kv_lengths", past_kv_lengths[i])?,
                    beam: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { requests })
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn phases(&self) -> Vec<RequestPhase> {
        self.requests.iter().map(|r| r.phase).collect()
    }

    /// Number the generation requests' beams `slot % beam_width`, counting
    /// slots from the first generation request. Context requests keep beam 0.
    pub fn assign_beams(&mut self, beam_width: usize) {
        if beam_width == 0 {
            return;
        }
        let generation = self
            .requests
            .iter_mut()
            .filter(|r| r.phase == RequestPhase::Generation);
        for (slot, request) in generation.enumerate() {
            request.beam = slot % beam_width;
        }
    }
}

impl From<Vec<Request>> for BatchDescriptor {
    fn from(requests: Vec<Request>) -> Self {
        Self::new(requests)
    }
}
