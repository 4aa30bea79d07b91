//! Resource addressing model: packed resource tokens, the physical resource
//! mapping table, per-resource texel addressing arithmetic, and the shared
//! bit-mask memory allocator behind the initialization and concurrency
//! features.

#[macro_use]
extern crate log;

pub mod allocator;
pub mod bit_indexing;
pub mod texel_address;
pub mod token;

pub use self::allocator::{TexelMemoryAllocation, TexelMemoryAllocator};
pub use self::texel_address::{TexelAddress, TexelAddressEmitter};
pub use self::token::{ResourceTokenEmitter, ResourceTokenType, TokenFields};
