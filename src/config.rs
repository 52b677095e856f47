//! Runtime configuration for tiled-raster-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Memory budget, tile size limits, spillover location and compression live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::weight::ElementKind;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tiled-raster-cache",
    about = "Exercise the out-of-core tiled raster cache"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Canvas width in pixels.
    #[arg(long, default_value_t = 4096)]
    pub width: u32,

    /// Canvas height in pixels.
    #[arg(long, default_value_t = 4096)]
    pub height: u32,

    /// Preferred tile edge in pixels (clamped to the configured range).
    #[arg(long)]
    pub tile_size: Option<u32>,

    /// Pixel element kind (u8, i16, f32, ...).
    #[arg(long, default_value = "u8")]
    pub element: ElementKind,

    /// Bands per pixel.
    #[arg(long, default_value_t = 1)]
    pub bands: u16,

    /// Override the global memory capacity in bytes.
    #[arg(long)]
    pub capacity: Option<u64>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Memory budget shared by all images.
    pub cache: CacheConfig,

    /// Tile size limits.
    pub tiling: TilingConfig,

    /// Spillover location and lifetime.
    pub spill: SpillConfig,

    /// Spill file compression.
    pub compression: CompressionConfig,
}

/// Global memory budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bytes of resident tiles allowed across every image.
    pub global_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            global_capacity: 256 * 1024 * 1024, // 256 MB
        }
    }
}

/// Tile edge limits, in pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    pub min_tile: u32,
    pub max_tile: u32,
    /// Edge used when the caller has no preference.
    pub default_tile: u32,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            min_tile: 64,
            max_tile: 256,
            default_tile: 256,
        }
    }
}

impl TilingConfig {
    /// Resolve a preferred tile edge into the configured range.
    pub fn clamp(&self, preferred: Option<u32>) -> u32 {
        let min = self.min_tile.max(1);
        let max = self.max_tile.max(min);
        preferred.unwrap_or(self.default_tile).clamp(min, max)
    }
}

/// Where evicted tiles go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillConfig {
    /// Parent directory; each image gets its own subdirectory.
    pub root: PathBuf,

    /// Spill file extension.
    pub extension: String,

    /// Remove spill trees when their store is dropped.
    pub delete_on_exit: bool,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("tiled-raster-cache"),
            extension: "tile".to_string(),
            delete_on_exit: true,
        }
    }
}

/// Compression settings for spill files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Apply zstd compression when writing to disk.
    pub zstd: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            zstd: true,
            zstd_level: 3,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
