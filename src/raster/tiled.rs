//! Read-only tiled image.
//!
//! Tiles are pulled from a [`SourceReader`] on first access and handed to
//! the cache manager; afterwards they are served from memory or promoted
//! back from the spill directory. The source is never asked twice for a
//! tile the cache still knows about.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::manager::{CacheManager, ImageId};
use crate::cache::tile::{PixelLayout, Raster, Region, Tile, TilePos};
use crate::raster::grid::TileGrid;
use crate::raster::source::SourceReader;
use crate::raster::{compose_region, release, ImageError};

pub struct TiledImage {
    id: ImageId,
    manager: Arc<CacheManager>,
    source: Arc<dyn SourceReader>,
    page: usize,
    grid: TileGrid,
    /// Fixed by the first decoded tile.
    layout: OnceLock<PixelLayout>,
    materialized: Mutex<HashSet<TilePos>>,
    disposed: AtomicBool,
}

impl TiledImage {
    /// Register `page` of `source` with the manager. The tile edge is
    /// `preferred` (or the configured default) clamped to the tiling limits.
    pub fn new(
        manager: Arc<CacheManager>,
        source: Arc<dyn SourceReader>,
        preferred_tile: Option<u32>,
        page: usize,
    ) -> Result<Self, ImageError> {
        let count = source.page_count();
        if page >= count {
            return Err(ImageError::PageOutOfRange { page, count });
        }

        let bounds = Region::new(0, 0, source.width(), source.height());
        let grid = TileGrid::with_tiling(manager.tiling(), bounds, preferred_tile, (0, 0))?;
        let id = ImageId::new();
        manager.get_or_create(id, grid.tiles_x(), grid.tiles_y())?;

        debug!(
            %id,
            width = bounds.width,
            height = bounds.height,
            tile = grid.tile_width(),
            page,
            "Opened tiled image"
        );

        Ok(Self {
            id,
            manager,
            source,
            page,
            grid,
            layout: OnceLock::new(),
            materialized: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn width(&self) -> u32 {
        self.grid.bounds().width
    }

    pub fn height(&self) -> u32 {
        self.grid.bounds().height
    }

    /// The pixel layout if a tile has been decoded already.
    pub fn layout(&self) -> Option<PixelLayout> {
        self.layout.get().copied()
    }

    /// The pixel layout, decoding tile (0, 0) if nothing has been read yet.
    pub fn pixel_layout(&self) -> Result<PixelLayout, ImageError> {
        if let Some(layout) = self.layout.get() {
            return Ok(*layout);
        }
        let tile = self.tile(0, 0)?;
        Ok(*self.layout.get_or_init(|| tile.raster().layout()))
    }

    /// Fetch a tile, decoding it from the source on a cache miss.
    pub fn tile(&self, tx: u32, ty: u32) -> Result<Tile, ImageError> {
        self.ensure_live()?;
        let pos = self.grid.check(tx, ty)?;
        if let Some(tile) = self.manager.get(self.id, pos)? {
            return Ok(tile);
        }

        let region = self.grid.tile_bounds(pos);
        let raster = self
            .source
            .decode_region(self.page, region)
            .map_err(|source| ImageError::Decode { region, source })?;
        if raster.bounds() != region {
            return Err(ImageError::SourceShape {
                expected: region,
                actual: raster.bounds(),
            });
        }

        let actual = raster.layout();
        let expected = *self.layout.get_or_init(|| actual);
        if expected != actual {
            return Err(ImageError::LayoutMismatch { expected, actual });
        }

        let tile = Tile::new(pos, raster);
        self.manager.insert(self.id, tile.clone())?;
        self.materialized.lock().insert(pos);

        debug!(id = %self.id, %pos, %region, weight = tile.weight(), "Decoded tile from source");
        Ok(tile)
    }

    /// Compose an arbitrary region of the image from its tiles.
    pub fn read_region(&self, region: Region) -> Result<Raster, ImageError> {
        let layout = self.pixel_layout()?;
        compose_region(&self.grid, layout, region, |pos| self.tile(pos.x, pos.y))
    }

    /// Whether the tile has ever been decoded from the source.
    pub fn is_materialized(&self, tx: u32, ty: u32) -> bool {
        self.materialized.lock().contains(&TilePos::new(tx, ty))
    }

    pub fn materialized_count(&self) -> usize {
        self.materialized.lock().len()
    }

    /// Release the image's store, memory and disk. Idempotent.
    pub fn dispose(&self) -> Result<(), ImageError> {
        release(&self.manager, self.id, &self.disposed)?;
        self.materialized.lock().clear();
        debug!(id = %self.id, "Disposed tiled image");
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), ImageError> {
        if self.is_disposed() {
            return Err(ImageError::Disposed);
        }
        Ok(())
    }
}

impl Drop for TiledImage {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(id = %self.id, error = %e, "Failed to release tiled image");
        }
    }
}
