//! Writable tiled image.
//!
//! A blank canvas whose every tile is inserted into the cache up front.
//! Writes replace one whole tile at a time; partial writes go through
//! [`WritableTiledImage::update_tile`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::manager::{CacheManager, ImageId};
use crate::cache::tile::{PixelLayout, Raster, Region, Tile, TileError};
use crate::raster::grid::TileGrid;
use crate::raster::{compose_region, release, ImageError};

pub struct WritableTiledImage {
    id: ImageId,
    manager: Arc<CacheManager>,
    grid: TileGrid,
    layout: PixelLayout,
    disposed: AtomicBool,
}

impl WritableTiledImage {
    /// Create a canvas covering `bounds` and fill the cache with blank tiles.
    ///
    /// `grid_offset` defaults to the image origin. Filling can spill tiles
    /// to disk when the canvas is larger than the image's share.
    pub fn new(
        manager: Arc<CacheManager>,
        bounds: Region,
        layout: PixelLayout,
        tile_size: Option<u32>,
        grid_offset: Option<(i64, i64)>,
    ) -> Result<Self, ImageError> {
        if layout.bands == 0 {
            return Err(TileError::NoBands.into());
        }
        let offset = grid_offset.unwrap_or((bounds.x, bounds.y));
        let grid = TileGrid::with_tiling(manager.tiling(), bounds, tile_size, offset)?;
        let id = ImageId::new();
        manager.get_or_create(id, grid.tiles_x(), grid.tiles_y())?;

        // From here on Drop releases the store if filling fails.
        let image = Self {
            id,
            manager,
            grid,
            layout,
            disposed: AtomicBool::new(false),
        };
        for pos in image.grid.positions() {
            let raster = Raster::blank(image.grid.tile_bounds(pos), layout);
            image.manager.insert(id, Tile::new(pos, raster))?;
        }

        info!(
            %id,
            %bounds,
            tile = grid.tile_width(),
            tiles = grid.tile_count(),
            "Created writable tiled image"
        );
        Ok(image)
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn bounds(&self) -> Region {
        self.grid.bounds()
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Replace the tile whose bounds are exactly `raster.bounds()`.
    pub fn set_data(&self, raster: Raster) -> Result<(), ImageError> {
        self.ensure_live()?;
        let region = raster.bounds();
        let actual = raster.layout();
        if actual.element != self.layout.element {
            return Err(ImageError::MisalignedWrite {
                region,
                reason: "element kind differs from the image",
            });
        }
        if actual.bands != self.layout.bands {
            return Err(ImageError::MisalignedWrite {
                region,
                reason: "band count differs from the image",
            });
        }
        let Some(pos) = self.grid.aligned_tile(&region) else {
            return Err(ImageError::MisalignedWrite {
                region,
                reason: "bounds are not the bounds of a tile",
            });
        };

        let raster = Raster::new(region, self.layout, raster.into_data())?;
        self.manager.remove(self.id, pos)?;
        self.manager.insert(self.id, Tile::new(pos, raster))?;
        debug!(id = %self.id, %pos, "Replaced tile");
        Ok(())
    }

    /// A copy of the tile's current contents.
    pub fn tile(&self, tx: u32, ty: u32) -> Result<Tile, ImageError> {
        self.ensure_live()?;
        let pos = self.grid.check(tx, ty)?;
        self.manager
            .get(self.id, pos)?
            .ok_or(ImageError::MissingTile(pos))
    }

    /// Mutate one tile in place.
    pub fn update_tile<R>(
        &self,
        tx: u32,
        ty: u32,
        f: impl FnOnce(&mut Raster) -> R,
    ) -> Result<R, ImageError> {
        self.ensure_live()?;
        let pos = self.grid.check(tx, ty)?;
        self.manager
            .with_tile_mut(self.id, pos, |tile| f(tile.raster_mut()))?
            .ok_or(ImageError::MissingTile(pos))
    }

    pub fn read_region(&self, region: Region) -> Result<Raster, ImageError> {
        self.ensure_live()?;
        compose_region(&self.grid, self.layout, region, |pos| {
            self.manager
                .get(self.id, pos)?
                .ok_or(ImageError::MissingTile(pos))
        })
    }

    /// Release the image's store, memory and disk. Idempotent.
    pub fn dispose(&self) -> Result<(), ImageError> {
        release(&self.manager, self.id, &self.disposed)?;
        debug!(id = %self.id, "Disposed writable tiled image");
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

impl Drop for WritableTiledImage {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(id = %self.id, error = %e, "Failed to release writable tiled image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tile::{ColorInterpretation, TilePos};
    use crate::cache::weight::ElementKind;
    use crate::config::Config;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir, capacity: u64) -> Arc<CacheManager> {
        let mut config = Config::default();
        config.cache.global_capacity = capacity;
        config.spill.root = tmp.path().to_path_buf();
        Arc::new(CacheManager::new(&config))
    }

    fn canvas(manager: Arc<CacheManager>) -> WritableTiledImage {
        WritableTiledImage::new(
            manager,
            Region::new(0, 0, 300, 300),
            PixelLayout::gray(ElementKind::U8),
            Some(256),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_canvas_starts_blank() {
        let tmp = TempDir::new().unwrap();
        let image = canvas(manager(&tmp, 1 << 20));
        assert_eq!((image.grid().tiles_x(), image.grid().tiles_y()), (2, 2));

        let corner = image.tile(1, 1).unwrap();
        assert_eq!(corner.raster().bounds(), Region::new(256, 256, 44, 44));
        assert!(corner.raster().data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_set_data_requires_alignment() {
        let tmp = TempDir::new().unwrap();
        let image = canvas(manager(&tmp, 1 << 20));
        let layout = PixelLayout::gray(ElementKind::U8);

        let mut aligned = Raster::blank(Region::new(256, 256, 44, 44), layout);
        aligned.fill(9u8).unwrap();
        image.set_data(aligned).unwrap();
        let tile = image.tile(1, 1).unwrap();
        assert!(tile.raster().data().iter().all(|&b| b == 9));

        let shifted = Raster::blank(Region::new(260, 260, 44, 44), layout);
        assert!(matches!(
            image.set_data(shifted),
            Err(ImageError::MisalignedWrite { .. })
        ));

        let wrong_size = Raster::blank(Region::new(0, 0, 128, 128), layout);
        assert!(matches!(
            image.set_data(wrong_size),
            Err(ImageError::MisalignedWrite { .. })
        ));

        let wrong_kind = Raster::blank(
            Region::new(0, 0, 256, 256),
            PixelLayout::gray(ElementKind::U16),
        );
        assert!(matches!(
            image.set_data(wrong_kind),
            Err(ImageError::MisalignedWrite { .. })
        ));
    }

    #[test]
    fn test_set_data_keeps_image_color() {
        let tmp = TempDir::new().unwrap();
        let layout = PixelLayout::new(ElementKind::U8, 3, ColorInterpretation::Rgb);
        let image = WritableTiledImage::new(
            manager(&tmp, 1 << 20),
            Region::new(0, 0, 64, 64),
            layout,
            None,
            None,
        )
        .unwrap();

        let incoming = PixelLayout::new(ElementKind::U8, 3, ColorInterpretation::Multiband);
        image
            .set_data(Raster::blank(Region::new(0, 0, 64, 64), incoming))
            .unwrap();
        assert_eq!(image.tile(0, 0).unwrap().raster().layout(), layout);
    }

    #[test]
    fn test_writes_survive_spill() {
        let tmp = TempDir::new().unwrap();
        // One 64x64 u16 tile fits, the other three spill.
        let image = WritableTiledImage::new(
            manager(&tmp, 8192),
            Region::new(-64, 128, 128, 128),
            PixelLayout::gray(ElementKind::U16),
            Some(64),
            None,
        )
        .unwrap();

        for (i, pos) in image.grid().positions().collect::<Vec<_>>().into_iter().enumerate() {
            image
                .update_tile(pos.x, pos.y, |raster| raster.fill(i as u16 * 1000).unwrap())
                .unwrap();
        }
        for (i, pos) in image.grid().positions().collect::<Vec<_>>().into_iter().enumerate() {
            let tile = image.tile(pos.x, pos.y).unwrap();
            let samples = tile.raster().samples::<u16>().unwrap();
            assert!(samples.iter().all(|&v| v == i as u16 * 1000), "tile {pos}");
        }
    }

    #[test]
    fn test_read_region_across_tiles() {
        let tmp = TempDir::new().unwrap();
        let image = canvas(manager(&tmp, 1 << 20));
        image
            .update_tile(1, 0, |raster| raster.fill(3u8).unwrap())
            .unwrap();

        let raster = image.read_region(Region::new(250, 0, 10, 1)).unwrap();
        assert_eq!(raster.data(), &[0, 0, 0, 0, 0, 0, 3, 3, 3, 3]);
    }

    #[test]
    fn test_misaligned_grid_offset() {
        let tmp = TempDir::new().unwrap();
        let result = WritableTiledImage::new(
            manager(&tmp, 1 << 20),
            Region::new(10, 10, 100, 100),
            PixelLayout::gray(ElementKind::U8),
            Some(64),
            Some((0, 0)),
        );
        assert!(matches!(result, Err(ImageError::InvalidGeometry(_))));
    }

    #[test]
    fn test_tile_too_large_for_budget() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, 1000);
        let result = WritableTiledImage::new(
            manager.clone(),
            Region::new(0, 0, 64, 64),
            PixelLayout::gray(ElementKind::U8),
            None,
            None,
        );
        assert!(matches!(result, Err(ImageError::Cache(_))));
        assert_eq!(manager.image_count(), 0);
    }

    #[test]
    fn test_drop_releases_store() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, 1 << 20);
        let image = canvas(manager.clone());
        let id = image.id();
        assert!(manager.get(id, TilePos::new(0, 0)).unwrap().is_some());
        drop(image);
        assert!(!manager.contains(id));
    }
}
