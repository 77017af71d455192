use std::ops::Range;

use crate::config::{AttentionConfig, CacheLayout, TokenLayout};
use crate::error::{AttentionError, Result};
use crate::request::{BatchDescriptor, RequestPhase};

/// Split of one batch into its context prefix and generation suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPartition {
    pub num_context_requests: usize,
    /// Activation rows occupied by the context prefix.
    pub context_token_count: usize,
    pub num_generation_requests: usize,
}

impl BatchPartition {
    pub fn num_requests(&self) -> usize {
        self.num_context_requests + self.num_generation_requests
    }

    pub fn is_mixed(&self) -> bool {
        self.num_context_requests > 0 && self.num_generation_requests > 0
    }

    pub fn context_requests(&self) -> Range<usize> {
        0..self.num_context_requests
    }

    pub fn generation_requests(&self) -> Range<usize> {
        self.num_context_requests..self.num_requests()
    }

    /// Rows the whole batch occupies when generation requests add one row each.
    pub fn total_rows(&self) -> usize {
        self.context_token_count + self.num_generation_requests
    }
}

/// Pure scan of a batch's phase tags.
#[derive(Debug, Clone, Copy)]
pub struct BatchPartitioner {
    token_layout: TokenLayout,
    cache_layout: CacheLayout,
    mixed_supported: bool,
}

impl BatchPartitioner {
    pub fn new(config: &AttentionConfig) -> Self {
        Self {
            token_layout: config.token_layout,
            cache_layout: config.cache_layout,
            mixed_supported: config.supports_mixed_batches(),
        }
    }

    /// Count the leading context requests and the rows they occupy.
    ///
    /// Packed tokens contribute each request's context length; padded tokens
    /// contribute `padded_seq_len` rows per request.
    pub fn partition(&self, batch: &BatchDescriptor, padded_seq_len: usize) -> Result<BatchPartition> {
        let requests = batch.requests();
        let mut num_context_requests = 0;
        let mut context_token_count = 0;
        for request in requests {
            if request.phase != RequestPhase::Context {
                break;
            }
            num_context_requests += 1;
            context_token_count += match self.token_layout {
                TokenLayout::Packed => request.context_length,
                TokenLayout::Padded => padded_seq_len,
            };
        }
        if let Some((offset, request)) = requests[num_context_requests..]
            .iter()
            .enumerate()
            .find(|(_, r)| r.phase != RequestPhase::Generation)
        {
            return Err(AttentionError::PhaseInterleaved {
                index: num_context_requests + offset,
                found: request.phase,
            });
        }

        let partition = BatchPartition {
            num_context_requests,
            context_token_count,
            num_generation_requests: requests.len() - num_context_requests,
        };
        if partition.is_mixed() && !self.mixed_supported {
            return Err(AttentionError::MixedBatchUnsupported {
                cache: self.cache_layout.as_str(),
                layout: self.token_layout.as_str(),
            });
        }
        Ok(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::request::Request;

    fn partitioner(cache: CacheLayout, tokens: TokenLayout) -> BatchPartitioner {
        BatchPartitioner::new(&AttentionConfig {
            cache_layout: cache,
            token_layout: tokens,
            ..Default::default()
        })
    }

    fn batch(ctx: &[usize], gen: usize) -> BatchDescriptor {
        let mut requests: Vec<_> = ctx.iter().map(|&l| Request::context(l)).collect();
        requests.extend((0..gen).map(|_| Request::generation(4, 6)));
        BatchDescriptor::new(requests)
    }

    #[test]
    fn packed_prefix_sums_context_lengths() {
        let p = partitioner(CacheLayout::Paged, TokenLayout::Packed)
            .partition(&batch(&[5, 7], 2), 1)
            .unwrap();
        assert_eq!(p.num_context_requests, 2);
        assert_eq!(p.context_token_count, 12);
        assert_eq!(p.num_generation_requests, 2);
        assert_eq!(p.generation_requests(), 2..4);
        assert_eq!(p.total_rows(), 14);
    }

    #[test]
    fn padded_counts_rows_per_request() {
        let p = partitioner(CacheLayout::Linear, TokenLayout::Padded)
            .partition(&batch(&[5, 7, 3], 0), 16)
            .unwrap();
        assert_eq!(p.context_token_count, 48);
        assert!(!p.is_mixed());
    }

    #[test]
    fn all_generation_batch() {
        let p = partitioner(CacheLayout::Linear, TokenLayout::Padded)
            .partition(&batch(&[], 8), 1)
            .unwrap();
        assert_eq!(p.num_context_requests, 0);
        assert_eq!(p.context_token_count, 0);
        assert_eq!(p.num_generation_requests, 8);
    }

    #[test]
    fn empty_batch_is_empty_partition() {
        let p = partitioner(CacheLayout::Paged, TokenLayout::Packed)
            .partition(&BatchDescriptor::default(), 1)
            .unwrap();
        assert_eq!(p.num_requests(), 0);
    }

    #[test]
    fn interleaved_phases_are_rejected() {
        let requests = vec![
            Request::context(3),
            Request::generation(2, 4),
            Request::context(5),
        ];
        let err = partitioner(CacheLayout::Paged, TokenLayout::Packed)
            .partition(&BatchDescriptor::new(requests), 1)
            .unwrap_err();
        match err {
            AttentionError::PhaseInterleaved { index, found } => {
                assert_eq!(index, 2);
                assert_eq!(found, RequestPhase::Context);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn generation_first_then_context_is_rejected() {
        let requests = vec![Request::generation(2, 4), Request::context(5)];
        let err = partitioner(CacheLayout::Paged, TokenLayout::Packed)
            .partition(&BatchDescriptor::new(requests), 1)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BatchContract);
    }

    #[test]
    fn mixed_acceptance_follows_config() {
        let mixed = batch(&[5], 1);
        for cache in [CacheLayout::Linear, CacheLayout::Paged] {
            for tokens in [TokenLayout::Packed, TokenLayout::Padded] {
                let config = AttentionConfig {
                    cache_layout: cache,
                    token_layout: tokens,
                    ..Default::default()
                };
                let accepted = BatchPartitioner::new(&config).partition(&mixed, 8).is_ok();
                assert_eq!(accepted, config.supports_mixed_batches(), "{cache:?}/{tokens:?}");
            }
        }
    }

    #[test]
    fn mixed_batch_needs_paged_and_packed() {
        let mixed = batch(&[5], 1);
        for (cache, tokens) in [
            (CacheLayout::Linear, TokenLayout::Packed),
            (CacheLayout::Paged, TokenLayout::Padded),
            (CacheLayout::Linear, TokenLayout::Padded),
        ] {
            let err = partitioner(cache, tokens).partition(&mixed, 8).unwrap_err();
            assert!(
                matches!(err, AttentionError::MixedBatchUnsupported { .. }),
                "{cache:?}/{tokens:?}"
            );
        }
    }
}
