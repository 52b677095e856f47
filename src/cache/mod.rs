//! Out-of-core tile cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`weight`]: Element kinds and the tile byte-weight model
//! - [`tile`]: Tile, Raster, Region and PixelLayout definitions
//! - [`shard`]: Quad-tree directory sharding for spilled tiles
//! - [`codec`]: Spill file encoding (header + optional zstd)
//! - [`store`]: Per-image store with FIFO eviction and promotion
//! - [`manager`]: Identity-to-store map sharing one memory budget

pub mod codec;
pub mod manager;
pub mod shard;
pub mod store;
pub mod tile;
pub mod weight;
