//! Tile and raster types.
//!
//! A [`Raster`] is a rectangular, band-interleaved pixel buffer placed at a
//! pixel origin. A [`Tile`] wraps a raster with its grid position and its
//! precomputed byte weight. Tiles are the unit of caching and spillover.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::weight::{self, ElementKind, Sample};

#[derive(Error, Debug)]
pub enum TileError {
    #[error("Unsupported pixel element kind: {0}")]
    UnsupportedElementKind(String),

    #[error("Pixel buffer has {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Element kind mismatch: expected {expected}, got {actual}")]
    ElementMismatch {
        expected: ElementKind,
        actual: ElementKind,
    },

    #[error("Pixel layout mismatch: expected {expected:?}, got {actual:?}")]
    LayoutMismatch {
        expected: PixelLayout,
        actual: PixelLayout,
    },

    #[error("Raster must have at least one band")]
    NoBands,
}

/// Grid coordinates of a tile, unique within one image's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TilePos {
    pub x: u32,
    pub y: u32,
}

impl TilePos {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for TilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i64 {
        self.x + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y + self.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Overlap of two regions, or `None` if they do not touch.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Region::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}x{}]",
            self.x, self.y, self.width, self.height
        )
    }
}

/// How bands map to colors. The cache never interprets this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorInterpretation {
    Gray,
    GrayAlpha,
    Rgb,
    Rgba,
    Palette,
    Multiband,
}

impl ColorInterpretation {
    pub(crate) fn code(&self) -> u8 {
        match self {
            ColorInterpretation::Gray => 0,
            ColorInterpretation::GrayAlpha => 1,
            ColorInterpretation::Rgb => 2,
            ColorInterpretation::Rgba => 3,
            ColorInterpretation::Palette => 4,
            ColorInterpretation::Multiband => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ColorInterpretation::Gray),
            1 => Some(ColorInterpretation::GrayAlpha),
            2 => Some(ColorInterpretation::Rgb),
            3 => Some(ColorInterpretation::Rgba),
            4 => Some(ColorInterpretation::Palette),
            5 => Some(ColorInterpretation::Multiband),
            _ => None,
        }
    }

    /// Reasonable default for a band count.
    pub fn for_bands(bands: u16) -> Self {
        match bands {
            1 => ColorInterpretation::Gray,
            2 => ColorInterpretation::GrayAlpha,
            3 => ColorInterpretation::Rgb,
            4 => ColorInterpretation::Rgba,
            _ => ColorInterpretation::Multiband,
        }
    }
}

/// Pixel layout and color descriptor shared by every tile of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelLayout {
    pub element: ElementKind,
    pub bands: u16,
    pub color: ColorInterpretation,
}

impl PixelLayout {
    pub fn new(element: ElementKind, bands: u16, color: ColorInterpretation) -> Self {
        Self {
            element,
            bands,
            color,
        }
    }

    /// Single-band layout.
    pub fn gray(element: ElementKind) -> Self {
        Self::new(element, 1, ColorInterpretation::Gray)
    }

    /// Bytes occupied by one pixel (all bands).
    pub fn pixel_bytes(&self) -> usize {
        self.bands as usize * self.element.bytes_per_element()
    }
}

/// A band-interleaved pixel buffer with a pixel origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    bounds: Region,
    layout: PixelLayout,
    data: Vec<u8>,
}

impl Raster {
    /// Wrap an existing byte buffer, checking its length against the bounds.
    pub fn new(bounds: Region, layout: PixelLayout, data: Vec<u8>) -> Result<Self, TileError> {
        if layout.bands == 0 {
            return Err(TileError::NoBands);
        }
        let expected = Self::byte_len(bounds, layout);
        if data.len() != expected {
            return Err(TileError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            bounds,
            layout,
            data,
        })
    }

    /// A zero-filled raster.
    pub fn blank(bounds: Region, layout: PixelLayout) -> Self {
        Self {
            bounds,
            layout,
            data: vec![0u8; Self::byte_len(bounds, layout)],
        }
    }

    /// Build a raster from typed samples; the element kind follows `T`.
    pub fn from_samples<T: Sample>(
        bounds: Region,
        bands: u16,
        color: ColorInterpretation,
        samples: &[T],
    ) -> Result<Self, TileError> {
        let layout = PixelLayout::new(T::KIND, bands, color);
        Self::new(bounds, layout, bytemuck::cast_slice(samples).to_vec())
    }

    fn byte_len(bounds: Region, layout: PixelLayout) -> usize {
        bounds.width as usize * bounds.height as usize * layout.pixel_bytes()
    }

    pub fn bounds(&self) -> Region {
        self.bounds
    }

    pub fn width(&self) -> u32 {
        self.bounds.width
    }

    pub fn height(&self) -> u32 {
        self.bounds.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Elements per row (pixels times bands).
    pub fn row_stride_elements(&self) -> usize {
        self.bounds.width as usize * self.layout.bands as usize
    }

    /// Byte cost of this raster when cached.
    pub fn weight(&self) -> u64 {
        weight::weight(
            self.layout.element,
            self.row_stride_elements(),
            self.bounds.height as usize,
        )
    }

    /// Copy the samples out as `T`, which must match the element kind.
    pub fn samples<T: Sample>(&self) -> Result<Vec<T>, TileError> {
        if T::KIND != self.layout.element {
            return Err(TileError::ElementMismatch {
                expected: self.layout.element,
                actual: T::KIND,
            });
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Fill every sample with `value`.
    pub fn fill<T: Sample>(&mut self, value: T) -> Result<(), TileError> {
        if T::KIND != self.layout.element {
            return Err(TileError::ElementMismatch {
                expected: self.layout.element,
                actual: T::KIND,
            });
        }
        let bytes = bytemuck::bytes_of(&value);
        for chunk in self.data.chunks_exact_mut(bytes.len()) {
            chunk.copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Copy the overlapping area of `src` into this raster.
    ///
    /// Returns the region that was copied, or `None` when the rasters do not
    /// overlap.
    pub fn copy_from(&mut self, src: &Raster) -> Result<Option<Region>, TileError> {
        if src.layout.element != self.layout.element || src.layout.bands != self.layout.bands {
            return Err(TileError::LayoutMismatch {
                expected: self.layout,
                actual: src.layout,
            });
        }
        let Some(overlap) = self.bounds.intersection(&src.bounds) else {
            return Ok(None);
        };

        let pixel_bytes = self.layout.pixel_bytes();
        let row_bytes = overlap.width as usize * pixel_bytes;
        let dst_stride = self.bounds.width as usize * pixel_bytes;
        let src_stride = src.bounds.width as usize * pixel_bytes;
        let dst_col = (overlap.x - self.bounds.x) as usize * pixel_bytes;
        let src_col = (overlap.x - src.bounds.x) as usize * pixel_bytes;

        for row in 0..overlap.height as i64 {
            let dst_row = (overlap.y + row - self.bounds.y) as usize;
            let src_row = (overlap.y + row - src.bounds.y) as usize;
            let dst_start = dst_row * dst_stride + dst_col;
            let src_start = src_row * src_stride + src_col;
            self.data[dst_start..dst_start + row_bytes]
                .copy_from_slice(&src.data[src_start..src_start + row_bytes]);
        }

        Ok(Some(overlap))
    }
}

/// A cached tile: grid position, pixel contents and byte weight.
#[derive(Debug, Clone)]
pub struct Tile {
    pos: TilePos,
    raster: Raster,
    weight: u64,
    /// Contents are newer than any spill file for this position.
    dirty: bool,
}

impl Tile {
    /// A tile with fresh contents (not yet spilled).
    pub fn new(pos: TilePos, raster: Raster) -> Self {
        let weight = raster.weight();
        Self {
            pos,
            raster,
            weight,
            dirty: true,
        }
    }

    pub fn pos(&self) -> TilePos {
        self.pos
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    pub fn raster_mut(&mut self) -> &mut Raster {
        self.dirty = true;
        &mut self.raster
    }

    pub fn into_raster(self) -> Raster {
        self.raster
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}
