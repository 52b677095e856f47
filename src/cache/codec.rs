//! Spill codec: how an evicted tile is written to and read back from disk.
//!
//! [`RawTileCodec`] stores a fixed little-endian header followed by the
//! pixel payload, optionally zstd-compressed:
//!
//! ```text
//! magic "TRC1" | version u8 | element u8 | color u8 | compressed u8
//! bands u16 | width u32 | height u32 | origin_x i64 | origin_y i64
//! tile_x u32 | tile_y u32 | payload_len u64 | payload
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::cache::tile::{ColorInterpretation, PixelLayout, Raster, Region, Tile, TileError, TilePos};
use crate::cache::weight::ElementKind;
use crate::config::{CompressionConfig, Config};

const MAGIC: &[u8; 4] = b"TRC1";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 50;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Spill file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Not a tile spill file: {0}")]
    BadMagic(PathBuf),

    #[error("Unsupported spill file version {0}")]
    UnsupportedVersion(u8),

    #[error("Corrupt spill file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Tile(#[from] TileError),
}

/// Encodes and decodes tile contents at a filesystem path.
pub trait TileCodec: Send + Sync + fmt::Debug {
    /// File extension for spill files, without the dot.
    fn extension(&self) -> &str;

    fn encode(&self, tile: &Tile, path: &Path) -> Result<(), CodecError>;

    fn decode(&self, pos: TilePos, path: &Path) -> Result<Tile, CodecError>;
}

/// Header + payload codec with optional zstd compression.
#[derive(Debug, Clone)]
pub struct RawTileCodec {
    config: CompressionConfig,
    extension: String,
}

impl RawTileCodec {
    pub fn new(config: CompressionConfig, extension: impl Into<String>) -> Self {
        Self {
            config,
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.compression.clone(), config.spill.extension.clone())
    }

    fn header(&self, tile: &Tile, payload_len: usize) -> Vec<u8> {
        let raster = tile.raster();
        let layout = raster.layout();
        let bounds = raster.bounds();

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.push(VERSION);
        header.push(layout.element.code());
        header.push(layout.color.code());
        header.push(self.config.zstd as u8);
        header.extend_from_slice(&layout.bands.to_le_bytes());
        header.extend_from_slice(&bounds.width.to_le_bytes());
        header.extend_from_slice(&bounds.height.to_le_bytes());
        header.extend_from_slice(&bounds.x.to_le_bytes());
        header.extend_from_slice(&bounds.y.to_le_bytes());
        header.extend_from_slice(&tile.pos().x.to_le_bytes());
        header.extend_from_slice(&tile.pos().y.to_le_bytes());
        header.extend_from_slice(&(payload_len as u64).to_le_bytes());
        header
    }
}

impl TileCodec for RawTileCodec {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn encode(&self, tile: &Tile, path: &Path) -> Result<(), CodecError> {
        let io_err = |source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        };

        let data = tile.raster().data();
        let payload = if self.config.zstd {
            zstd::encode_all(data, self.config.zstd_level).map_err(io_err)?
        } else {
            data.to_vec()
        };

        let mut bytes = self.header(tile, payload.len());
        bytes.extend_from_slice(&payload);

        // Write beside the target and rename, so a failed write never
        // leaves a truncated tile at `path`.
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        if let Err(e) = fs::write(&partial, &bytes).and_then(|()| fs::rename(&partial, path)) {
            // The partial file must not linger as an extra leaf entry.
            let _ = fs::remove_file(&partial);
            return Err(io_err(e));
        }

        debug!(
            pos = %tile.pos(),
            path = %path.display(),
            raw = data.len(),
            stored = bytes.len(),
            "Encoded tile"
        );
        Ok(())
    }

    fn decode(&self, pos: TilePos, path: &Path) -> Result<Tile, CodecError> {
        let bytes = fs::read(path).map_err(|source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let corrupt = |reason: &str| CodecError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if bytes.len() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(CodecError::BadMagic(path.to_path_buf()));
        }

        let mut cursor = HeaderCursor::new(&bytes[4..HEADER_LEN]);
        let version = cursor.u8();
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let element = ElementKind::from_code(cursor.u8())?;
        let color = ColorInterpretation::from_code(cursor.u8())
            .ok_or_else(|| corrupt("unknown color interpretation"))?;
        let compressed = cursor.u8() != 0;
        let bands = cursor.u16();
        let width = cursor.u32();
        let height = cursor.u32();
        let origin_x = cursor.i64();
        let origin_y = cursor.i64();
        let stored_pos = TilePos::new(cursor.u32(), cursor.u32());
        let payload_len = cursor.u64() as usize;

        if stored_pos != pos {
            return Err(corrupt(&format!(
                "holds tile {stored_pos}, expected {pos}"
            )));
        }
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(corrupt("payload length mismatch"));
        }

        let data = if compressed {
            zstd::decode_all(payload).map_err(|source| CodecError::Io {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            payload.to_vec()
        };

        let raster = Raster::new(
            Region::new(origin_x, origin_y, width, height),
            PixelLayout::new(element, bands, color),
            data,
        )?;
        Ok(Tile::new(pos, raster))
    }
}

/// Little-endian reader over a header slice of known length.
struct HeaderCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> HeaderCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.offset..self.offset + N]);
        self.offset += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }
}
