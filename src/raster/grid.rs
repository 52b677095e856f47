//! Tile grid geometry.
//!
//! Splits an image's pixel bounds into a grid of fixed-size tiles. Tiles on
//! the right and bottom edges are truncated to the image bounds. Tile
//! positions are zero-based from the tile containing the image origin.

use crate::cache::tile::{Region, TilePos};
use crate::config::TilingConfig;
use crate::raster::ImageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    bounds: Region,
    tile_width: u32,
    tile_height: u32,
    grid_x_offset: i64,
    grid_y_offset: i64,
    tiles_x: u32,
    tiles_y: u32,
}

impl TileGrid {
    /// Build a grid. The grid offset must line tiles up with the image
    /// origin, i.e. be congruent to it modulo the tile size.
    pub fn new(
        bounds: Region,
        tile_width: u32,
        tile_height: u32,
        grid_offset: (i64, i64),
    ) -> Result<Self, ImageError> {
        if bounds.is_empty() {
            return Err(ImageError::InvalidGeometry(format!(
                "image bounds {bounds} are empty"
            )));
        }
        if tile_width == 0 || tile_height == 0 {
            return Err(ImageError::InvalidGeometry(
                "tile size must be non-zero".to_string(),
            ));
        }
        let (grid_x_offset, grid_y_offset) = grid_offset;
        if (bounds.x - grid_x_offset).rem_euclid(tile_width as i64) != 0
            || (bounds.y - grid_y_offset).rem_euclid(tile_height as i64) != 0
        {
            return Err(ImageError::InvalidGeometry(format!(
                "grid offset ({grid_x_offset}, {grid_y_offset}) does not align with origin ({}, {}) for {tile_width}x{tile_height} tiles",
                bounds.x, bounds.y
            )));
        }

        Ok(Self {
            bounds,
            tile_width,
            tile_height,
            grid_x_offset,
            grid_y_offset,
            tiles_x: bounds.width.div_ceil(tile_width),
            tiles_y: bounds.height.div_ceil(tile_height),
        })
    }

    /// Square tiles with the edge clamped to the configured range.
    pub fn with_tiling(
        tiling: &TilingConfig,
        bounds: Region,
        preferred: Option<u32>,
        grid_offset: (i64, i64),
    ) -> Result<Self, ImageError> {
        let edge = tiling.clamp(preferred);
        Self::new(bounds, edge, edge, grid_offset)
    }

    pub fn bounds(&self) -> Region {
        self.bounds
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    pub fn grid_offset(&self) -> (i64, i64) {
        (self.grid_x_offset, self.grid_y_offset)
    }

    pub fn tiles_x(&self) -> u32 {
        self.tiles_x
    }

    pub fn tiles_y(&self) -> u32 {
        self.tiles_y
    }

    pub fn tile_count(&self) -> u64 {
        self.tiles_x as u64 * self.tiles_y as u64
    }

    /// Absolute index of the first tile column, counted from the grid offset.
    pub fn min_tile_x(&self) -> i64 {
        (self.bounds.x - self.grid_x_offset).div_euclid(self.tile_width as i64)
    }

    /// Absolute index of the first tile row, counted from the grid offset.
    pub fn min_tile_y(&self) -> i64 {
        (self.bounds.y - self.grid_y_offset).div_euclid(self.tile_height as i64)
    }

    pub fn check(&self, tx: u32, ty: u32) -> Result<TilePos, ImageError> {
        if tx >= self.tiles_x || ty >= self.tiles_y {
            return Err(ImageError::TileOutOfRange {
                tx,
                ty,
                tiles_x: self.tiles_x,
                tiles_y: self.tiles_y,
            });
        }
        Ok(TilePos::new(tx, ty))
    }

    /// Pixel bounds of a tile, truncated at the image edge.
    pub fn tile_bounds(&self, pos: TilePos) -> Region {
        let x = self.bounds.x + pos.x as i64 * self.tile_width as i64;
        let y = self.bounds.y + pos.y as i64 * self.tile_height as i64;
        let width = self
            .tile_width
            .min((self.bounds.right() - x).max(0) as u32);
        let height = self
            .tile_height
            .min((self.bounds.bottom() - y).max(0) as u32);
        Region::new(x, y, width, height)
    }

    /// Every tile position, row by row.
    pub fn positions(&self) -> impl Iterator<Item = TilePos> + '_ {
        (0..self.tiles_y).flat_map(move |y| (0..self.tiles_x).map(move |x| TilePos::new(x, y)))
    }

    /// Tiles overlapping `region`, row by row.
    pub fn tiles_intersecting(&self, region: &Region) -> Vec<TilePos> {
        let Some(clipped) = self.bounds.intersection(region) else {
            return Vec::new();
        };
        let tw = self.tile_width as i64;
        let th = self.tile_height as i64;
        let x0 = ((clipped.x - self.bounds.x) / tw) as u32;
        let y0 = ((clipped.y - self.bounds.y) / th) as u32;
        let x1 = ((clipped.right() - 1 - self.bounds.x) / tw) as u32;
        let y1 = ((clipped.bottom() - 1 - self.bounds.y) / th) as u32;

        (y0..=y1)
            .flat_map(|y| (x0..=x1).map(move |x| TilePos::new(x, y)))
            .collect()
    }

    /// The tile whose bounds are exactly `region`, if any.
    pub fn aligned_tile(&self, region: &Region) -> Option<TilePos> {
        let dx = region.x - self.bounds.x;
        let dy = region.y - self.bounds.y;
        if dx < 0
            || dy < 0
            || dx % self.tile_width as i64 != 0
            || dy % self.tile_height as i64 != 0
        {
            return None;
        }
        let tx = u32::try_from(dx / self.tile_width as i64).ok()?;
        let ty = u32::try_from(dy / self.tile_height as i64).ok()?;
        let pos = self.check(tx, ty).ok()?;
        (self.tile_bounds(pos) == *region).then_some(pos)
    }
}
