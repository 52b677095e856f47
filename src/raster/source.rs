//! Source readers: where a read-only image gets its pixels on a cache miss.
//!
//! A [`SourceReader`] decodes an arbitrary region of one page of a larger
//! image. Format-specific decoders implement it outside this crate;
//! [`PatternSource`] is a deterministic procedural source.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::cache::tile::{PixelLayout, Raster, Region};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Page {0} not available")]
    NoSuchPage(usize),

    #[error("Region {0} is outside the source image")]
    OutOfBounds(Region),

    #[error("Decoder failed: {0}")]
    Decoder(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Random-access decoder for a large image.
pub trait SourceReader: Send + Sync {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn page_count(&self) -> usize {
        1
    }

    /// Decode exactly `region` of `page`. The returned raster's bounds must
    /// equal `region`.
    fn decode_region(&self, page: usize, region: Region) -> Result<Raster, SourceError>;
}

/// Procedural source whose bytes are a function of page, pixel and byte
/// offset. Counts decodes so callers can observe cache misses.
#[derive(Debug)]
pub struct PatternSource {
    width: u32,
    height: u32,
    pages: usize,
    layout: PixelLayout,
    decodes: AtomicU64,
}

impl PatternSource {
    pub fn new(width: u32, height: u32, layout: PixelLayout) -> Self {
        Self::with_pages(width, height, 1, layout)
    }

    pub fn with_pages(width: u32, height: u32, pages: usize, layout: PixelLayout) -> Self {
        Self {
            width,
            height,
            pages,
            layout,
            decodes: AtomicU64::new(0),
        }
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Number of `decode_region` calls served so far.
    pub fn decode_count(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    /// The raster this source produces for `region`, without counting a decode.
    pub fn render(&self, page: usize, region: Region) -> Raster {
        let pixel_bytes = self.layout.pixel_bytes();
        let mut raster = Raster::blank(region, self.layout);
        let data = raster.data_mut();
        let row_bytes = region.width as usize * pixel_bytes;

        for row in 0..region.height as usize {
            let y = region.y + row as i64;
            for col in 0..region.width as usize {
                let x = region.x + col as i64;
                let start = row * row_bytes + col * pixel_bytes;
                for k in 0..pixel_bytes {
                    data[start + k] = pattern_byte(page, x, y, k);
                }
            }
        }
        raster
    }
}

fn pattern_byte(page: usize, x: i64, y: i64, k: usize) -> u8 {
    (x.wrapping_mul(31)
        .wrapping_add(y.wrapping_mul(17))
        .wrapping_add(k as i64 * 7)
        .wrapping_add(page as i64 * 13)
        & 0xFF) as u8
}

impl SourceReader for PatternSource {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn page_count(&self) -> usize {
        self.pages
    }

    fn decode_region(&self, page: usize, region: Region) -> Result<Raster, SourceError> {
        if page >= self.pages {
            return Err(SourceError::NoSuchPage(page));
        }
        let full = Region::new(0, 0, self.width, self.height);
        if region.is_empty() || full.intersection(&region) != Some(region) {
            return Err(SourceError::OutOfBounds(region));
        }
        self.decodes.fetch_add(1, Ordering::Relaxed);
        Ok(self.render(page, region))
    }
}
