//! Scratch memory sizing and carving.
//!
//! Each phase describes its scratch needs as a list of named regions, every
//! one starting on a [`WORKSPACE_ALIGN`]-byte boundary. The caller allocates
//! one [`Workspace`] of at least [`WorkspaceSizer::workspace_size`] bytes and
//! reuses it for both phases of an invocation.

use crate::config::{AttentionConfig, Precision};
use crate::error::{AttentionError, Result};

/// Alignment of every workspace region, in bytes.
pub const WORKSPACE_ALIGN: usize = 128;

/// Tokens per tile when the generation kernel splits a long history.
pub const MULTI_BLOCK_TILE: usize = 256;

const I32_BYTES: usize = std::mem::size_of::<i32>();
const F32_BYTES: usize = std::mem::size_of::<f32>();

fn align_up(n: usize) -> usize {
    n.div_ceil(WORKSPACE_ALIGN) * WORKSPACE_ALIGN
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRegion {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
}

/// Ordered, aligned regions of one phase's scratch buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceLayout {
    regions: Vec<WorkspaceRegion>,
    total: usize,
}

impl WorkspaceLayout {
    /// Lay out `(name, bytes)` regions back to back. Empty regions are kept
    /// for lookup but take no space.
    pub fn from_sizes(sizes: &[(&'static str, usize)]) -> Self {
        let mut regions = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for &(name, size) in sizes {
            regions.push(WorkspaceRegion { name, offset, size });
            offset += align_up(size);
        }
        Self {
            regions,
            total: offset,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn regions(&self) -> &[WorkspaceRegion] {
        &self.regions
    }

    pub fn region(&self, name: &str) -> Option<&WorkspaceRegion> {
        self.regions.iter().find(|r| r.name == name)
    }
}

/// Head geometry the sizing formulas depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelGeometry {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub fmha_enabled: bool,
    pub multi_block_mode: bool,
    pub max_sequence_length: usize,
}

impl KernelGeometry {
    pub fn new(config: &AttentionConfig, head_size: usize, fmha_enabled: bool) -> Self {
        Self {
            num_heads: config.num_heads,
            num_kv_heads: config.num_kv_heads,
            head_size,
            fmha_enabled,
            multi_block_mode: config.multi_block_mode,
            max_sequence_length: config.max_sequence_length,
        }
    }
}

/// Regions of the context phase. The fused path only needs sequence
/// bookkeeping; the unfused path stages Q/K/V and the score matrices.
pub fn context_layout(
    geometry: &KernelGeometry,
    precision: Precision,
    batch_size: usize,
    max_context_length: usize,
) -> WorkspaceLayout {
    let size = precision.size_in_bytes();
    let unfused = !geometry.fmha_enabled;
    let tokens = batch_size * max_context_length;
    let scores = batch_size * geometry.num_heads * max_context_length * max_context_length;
    let q_hidden = geometry.num_heads * geometry.head_size;
    let kv_hidden = geometry.num_kv_heads * geometry.head_size;
    let when = |on: bool, bytes: usize| if on { bytes } else { 0 };

    WorkspaceLayout::from_sizes(&[
        (
            "attention_mask",
            when(unfused, size * batch_size * max_context_length * max_context_length),
        ),
        ("cu_seqlens", I32_BYTES * (batch_size + 1)),
        ("q_buf", when(unfused, size * tokens * q_hidden)),
        ("k_buf", when(unfused, size * tokens * kv_hidden)),
        ("v_buf", when(unfused, size * tokens * kv_hidden)),
        ("qk_buf", when(unfused, size * scores)),
        ("qkv_buf", when(unfused, size * tokens * q_hidden)),
        ("qk_buf_f32", when(unfused, F32_BYTES * scores)),
        ("padding_offset", I32_BYTES * tokens),
    ])
}

/// Regions of the generation phase. Only multi-block mode needs scratch:
/// per-tile partial outputs plus the running sum and max of each tile.
pub fn generation_layout(
    geometry: &KernelGeometry,
    precision: Precision,
    total_sequences: usize,
) -> WorkspaceLayout {
    let size = precision.size_in_bytes();
    let multi = geometry.multi_block_mode;
    let tiles = geometry.max_sequence_length.div_ceil(MULTI_BLOCK_TILE);
    let heads = total_sequences * geometry.num_heads;
    let when = |bytes: usize| if multi { bytes } else { 0 };

    WorkspaceLayout::from_sizes(&[
        ("partial_out", when(size * heads * geometry.head_size * tiles)),
        ("partial_sum", when(F32_BYTES * heads * tiles)),
        ("partial_max", when(F32_BYTES * heads * tiles)),
        ("block_counter", when(I32_BYTES * heads)),
    ])
}

/// Sizes the single workspace shared by both phases.
pub struct WorkspaceSizer<'k, K> {
    kernels: &'k K,
    geometry: KernelGeometry,
}

impl<'k, K: crate::kernels::AttentionKernels> WorkspaceSizer<'k, K> {
    pub fn new(kernels: &'k K, geometry: KernelGeometry) -> Self {
        Self { kernels, geometry }
    }

    pub fn context_workspace_size(
        &self,
        precision: Precision,
        batch_size: usize,
        max_context_length: usize,
    ) -> usize {
        self.kernels
            .context_workspace(&self.geometry, precision, batch_size, max_context_length)
            .total_bytes()
    }

    pub fn generation_workspace_size(&self, precision: Precision, total_sequences: usize) -> usize {
        self.kernels
            .generation_workspace(&self.geometry, precision, total_sequences)
            .total_bytes()
    }

    /// The phases never need scratch at the same time, so the larger of the
    /// two requirements covers an invocation.
    pub fn workspace_size(
        &self,
        precision: Precision,
        batch_size: usize,
        max_context_length: usize,
        total_sequences: usize,
    ) -> usize {
        self.context_workspace_size(precision, batch_size, max_context_length)
            .max(self.generation_workspace_size(precision, total_sequences))
    }
}

/// Caller-owned scratch buffer.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    bytes: Vec<u8>,
}

impl Workspace {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Split the buffer into the regions of `layout`.
    pub fn carve(&mut self, layout: &WorkspaceLayout) -> Result<WorkspaceRegions<'_>> {
        let required = layout.total_bytes();
        if self.bytes.len() < required {
            return Err(AttentionError::WorkspaceTooSmall {
                required,
                provided: self.bytes.len(),
            });
        }
        let mut rest: &mut [u8] = &mut self.bytes[..required];
        let mut cursor = 0;
        let mut regions = Vec::with_capacity(layout.regions().len());
        for region in layout.regions() {
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(region.offset - cursor);
            let (head, tail) = tail.split_at_mut(region.size);
            regions.push((region.name, head));
            rest = tail;
            cursor = region.offset + region.size;
        }
        Ok(WorkspaceRegions { regions })
    }
}

/// Disjoint mutable views of one carved workspace.
pub struct WorkspaceRegions<'a> {
    regions: Vec<(&'static str, &'a mut [u8])>,
}

impl WorkspaceRegions<'_> {
    pub fn get_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        self.regions
            .iter_mut()
            .find(|(n, _)| *n == name)
            .map(|(_, bytes)| &mut **bytes)
    }

    /// Store `values` little-endian at the start of region `name`.
    pub fn write_i32s(&mut self, name: &'static str, values: &[i32]) -> Result<()> {
        let region = self.get_mut(name).ok_or_else(|| {
            AttentionError::BatchContract(format!("workspace has no region '{name}'"))
        })?;
        let needed = values.len() * I32_BYTES;
        if region.len() < needed {
            return Err(AttentionError::WorkspaceTooSmall {
                required: needed,
                provided: region.len(),
            });
        }
        for (chunk, v) in region.chunks_exact_mut(I32_BYTES).zip(values) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    pub fn read_i32s(&mut self, name: &str, count: usize) -> Option<Vec<i32>> {
        let region = self.get_mut(name)?;
        if region.len() < count * I32_BYTES {
            return None;
        }
        Some(
            region
                .chunks_exact(I32_BYTES)
                .take(count)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::ReferenceKernels;

    fn geometry(fmha: bool, multi_block: bool) -> KernelGeometry {
        KernelGeometry {
            num_heads: 4,
            num_kv_heads: 2,
            head_size: 16,
            fmha_enabled: fmha,
            multi_block_mode: multi_block,
            max_sequence_length: 1024,
        }
    }

    #[test]
    fn regions_are_aligned() {
        let layout = context_layout(&geometry(false, false), Precision::F16, 3, 7);
        for region in layout.regions() {
            assert_eq!(region.offset % WORKSPACE_ALIGN, 0, "{}", region.name);
        }
        assert_eq!(layout.total_bytes() % WORKSPACE_ALIGN, 0);
        // (3 + 1) i32 rounded up to one alignment unit
        let cu = layout.region("cu_seqlens").unwrap();
        assert_eq!(cu.size, 16);
    }

    #[test]
    fn fused_context_needs_only_bookkeeping() {
        let fused = context_layout(&geometry(true, false), Precision::F16, 4, 64);
        let unfused = context_layout(&geometry(false, false), Precision::F16, 4, 64);
        assert_eq!(fused.region("qk_buf").unwrap().size, 0);
        assert!(fused.total_bytes() < unfused.total_bytes());
        assert_eq!(
            fused.total_bytes(),
            align_up(4 * 5) + align_up(4 * 4 * 64)
        );
    }

    #[test]
    fn generation_scratch_only_in_multi_block_mode() {
        assert_eq!(
            generation_layout(&geometry(false, false), Precision::F32, 8).total_bytes(),
            0
        );
        let multi = generation_layout(&geometry(false, true), Precision::F32, 8);
        // 1024 / 256 = 4 tiles, 8 seqs * 4 heads = 32 rows
        assert_eq!(multi.region("partial_out").unwrap().size, 4 * 32 * 16 * 4);
        assert_eq!(multi.region("block_counter").unwrap().size, 4 * 32);
    }

    #[test]
    fn sizer_takes_max_and_is_idempotent() {
        let kernels = ReferenceKernels::new();
        let sizer = WorkspaceSizer::new(&kernels, geometry(false, true));
        let a = sizer.workspace_size(Precision::F16, 4, 32, 4);
        let b = sizer.workspace_size(Precision::F16, 4, 32, 4);
        assert_eq!(a, b);
        assert_eq!(
            a,
            sizer
                .context_workspace_size(Precision::F16, 4, 32)
                .max(sizer.generation_workspace_size(Precision::F16, 4))
        );
    }

    #[test]
    fn sizer_is_monotonic() {
        let kernels = ReferenceKernels::new();
        let sizer = WorkspaceSizer::new(&kernels, geometry(false, true));
        let mut prev = 0;
        for batch in 1..6 {
            for ctx in [1, 8, 33, 128] {
                let size = sizer.workspace_size(Precision::Bf16, batch, ctx, batch);
                assert!(size >= prev || ctx == 1);
                let wider = sizer.workspace_size(Precision::Bf16, batch + 1, ctx, batch + 1);
                let longer = sizer.workspace_size(Precision::Bf16, batch, ctx + 1, batch);
                assert!(wider >= size);
                assert!(longer >= size);
                prev = size;
            }
        }
    }

    #[test]
    fn carve_rejects_short_buffer() {
        let layout = context_layout(&geometry(false, false), Precision::F16, 2, 8);
        let mut ws = Workspace::new(layout.total_bytes() - 1);
        match ws.carve(&layout) {
            Err(AttentionError::WorkspaceTooSmall { required, provided }) => {
                assert_eq!(required, layout.total_bytes());
                assert_eq!(provided, required - 1);
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn carved_regions_are_disjoint() {
        let layout = context_layout(&geometry(false, false), Precision::F32, 2, 4);
        let mut ws = Workspace::new(layout.total_bytes() + 64);
        let mut regions = ws.carve(&layout).unwrap();
        regions.write_i32s("cu_seqlens", &[0, 3, 7]).unwrap();
        regions.write_i32s("padding_offset", &[9; 8]).unwrap();
        assert_eq!(regions.read_i32s("cu_seqlens", 3).unwrap(), vec![0, 3, 7]);
        assert_eq!(regions.read_i32s("padding_offset", 2).unwrap(), vec![9, 9]);
        assert!(regions.write_i32s("cu_seqlens", &[0; 4]).is_err());
        assert!(regions.get_mut("missing").is_none());
    }
}
