//! KV cache addressing.
//!
//! Two representations share one row-addressing contract ([`KvCacheBuffer`]):
//! - [`LinearKvBuffer`]: one contiguous region per sequence slot
//! - [`PagedKvBuffer`]: fixed-size blocks in a [`KvBlockPool`], located per
//!   sequence through a [`BlockPointerTable`]
//!
//! [`BlockPool`] and [`BlockTable`] are host-side bookkeeping used to build
//! pointer tables.

mod block_address;
mod block_pool;
mod block_table;
mod buffer;
mod error;
mod pool;
pub mod quantization;

pub use block_address::{BlockAddress, BlockPointerTable};
pub use block_pool::{BlockId, BlockPool};
pub use block_table::BlockTable;
pub use buffer::{KvCacheBuffer, KvHalf, LinearKvBuffer, PagedKvBuffer};
pub use error::CacheError;
pub use pool::KvBlockPool;
pub use quantization::{KvCacheQuantMode, QuantizationScales};
