use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("out of blocks: requested {requested}, available {available}")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("block {block_id} is not allocated")]
    BlockNotAllocated { block_id: usize },

    #[error("sequence {sequence} has a null pointer for block {block}")]
    NullBlock { sequence: usize, block: usize },

    #[error("block address {address:#x} is outside the pool")]
    AddressOutOfRange { address: u64 },

    #[error("block address {address:#x} is not aligned to the {block_bytes}-byte block stride")]
    MisalignedAddress { address: u64, block_bytes: u64 },

    #[error("position {position} is beyond cache capacity {capacity}")]
    PositionOutOfRange { position: usize, capacity: usize },

    #[error("sequence {sequence} is outside the {available} addressable sequences")]
    SequenceOutOfRange { sequence: usize, available: usize },

    #[error("invalid cache geometry: {reason}")]
    InvalidGeometry { reason: String },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl CacheError {
    pub(crate) fn geometry(reason: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            reason: reason.into(),
        }
    }
}
