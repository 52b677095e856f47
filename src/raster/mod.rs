//! Tiled image facades over the cache.
//!
//! - [`grid`]: Tile grid geometry (clamped tile size, edge truncation)
//! - [`source`]: SourceReader trait and a procedural source
//! - [`tiled`]: TiledImage, read-only tiles decoded from a source on miss
//! - [`writable`]: WritableTiledImage, a blank canvas with aligned writes

pub mod grid;
pub mod source;
pub mod tiled;
pub mod writable;

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::cache::manager::{CacheError, CacheManager, ImageId};
use crate::cache::tile::{PixelLayout, Raster, Region, Tile, TileError, TilePos};
use crate::raster::grid::TileGrid;
use crate::raster::source::SourceError;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Invalid image geometry: {0}")]
    InvalidGeometry(String),

    #[error("Tile ({tx}, {ty}) is outside the {tiles_x}x{tiles_y} tile grid")]
    TileOutOfRange {
        tx: u32,
        ty: u32,
        tiles_x: u32,
        tiles_y: u32,
    },

    #[error("Write of {region} does not match a tile: {reason}")]
    MisalignedWrite { region: Region, reason: &'static str },

    #[error("Pixel layout mismatch: image is {expected:?}, tile is {actual:?}")]
    LayoutMismatch {
        expected: PixelLayout,
        actual: PixelLayout,
    },

    #[error("Source returned {actual} for requested region {expected}")]
    SourceShape { expected: Region, actual: Region },

    #[error("Page {page} out of range, source has {count} pages")]
    PageOutOfRange { page: usize, count: usize },

    #[error("Source decode failed for {region}: {source}")]
    Decode {
        region: Region,
        #[source]
        source: SourceError,
    },

    #[error("Tile {0} is missing from the cache")]
    MissingTile(TilePos),

    #[error("Image has been disposed")]
    Disposed,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Tile(#[from] TileError),
}

/// Assemble `region` from the tiles that cover it.
fn compose_region(
    grid: &TileGrid,
    layout: PixelLayout,
    region: Region,
    mut fetch: impl FnMut(TilePos) -> Result<Tile, ImageError>,
) -> Result<Raster, ImageError> {
    if region.is_empty() || grid.bounds().intersection(&region) != Some(region) {
        return Err(ImageError::InvalidGeometry(format!(
            "region {region} is not inside image bounds {}",
            grid.bounds()
        )));
    }

    let mut out = Raster::blank(region, layout);
    for pos in grid.tiles_intersecting(&region) {
        let tile = fetch(pos)?;
        out.copy_from(tile.raster())?;
    }
    Ok(out)
}

/// Unregister an image once. A failed cleanup clears `disposed` so the
/// owner can call again; by then the store is gone and the retry succeeds.
fn release(manager: &CacheManager, id: ImageId, disposed: &AtomicBool) -> Result<(), ImageError> {
    if disposed.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    match manager.remove_all(id) {
        Ok(()) | Err(CacheError::UnknownImage(_)) => Ok(()),
        Err(e) => {
            disposed.store(false, Ordering::Release);
            Err(e.into())
        }
    }
}
