//! tiled-raster-cache: out-of-core tiled raster cache.
//!
//! Lets images far larger than memory be accessed as grids of fixed-size
//! tiles. A [`CacheManager`] splits one memory budget equally between the
//! images registered with it; each image's [`TileStore`] evicts its oldest
//! tiles to a quad-tree sharded spill directory and promotes them back on
//! read.
//!
//!   TiledImage / WritableTiledImage → CacheManager → TileStore → DirectoryShard + TileCodec

pub mod cache;
pub mod config;
pub mod raster;

pub use cache::codec::{RawTileCodec, TileCodec};
pub use cache::manager::{CacheError, CacheManager, ImageId};
pub use cache::shard::DirectoryShard;
pub use cache::store::{StoreError, TileStore};
pub use cache::tile::{ColorInterpretation, PixelLayout, Raster, Region, Tile, TilePos};
pub use cache::weight::ElementKind;
pub use config::Config;
pub use raster::source::{PatternSource, SourceReader};
pub use raster::tiled::TiledImage;
pub use raster::writable::WritableTiledImage;
pub use raster::ImageError;
