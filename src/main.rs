use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{info, warn};

use tiled_raster_cache::config::{Cli, Config};
use tiled_raster_cache::{
    CacheManager, ColorInterpretation, PatternSource, PixelLayout, Region, TiledImage,
    WritableTiledImage,
};

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "tiled_raster_cache=debug"
    } else {
        "tiled_raster_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("tiled-raster-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(capacity) = cli.capacity {
        config.cache.global_capacity = capacity;
    }

    info!(
        global_capacity = config.cache.global_capacity,
        min_tile = config.tiling.min_tile,
        max_tile = config.tiling.max_tile,
        spill_root = %config.spill.root.display(),
        zstd = config.compression.zstd,
        "Configuration loaded"
    );

    let manager = Arc::new(CacheManager::new(&config));
    let layout = PixelLayout::new(
        cli.element,
        cli.bands,
        ColorInterpretation::for_bands(cli.bands),
    );
    let bounds = Region::new(0, 0, cli.width, cli.height);

    // A blank canvas and a procedural source share one budget.
    let canvas = WritableTiledImage::new(manager.clone(), bounds, layout, cli.tile_size, None)?;
    let pattern = Arc::new(PatternSource::new(cli.width, cli.height, layout));
    let reader = TiledImage::new(manager.clone(), pattern.clone(), cli.tile_size, 0)?;

    let grid = *canvas.grid();
    info!(
        tiles_x = grid.tiles_x(),
        tiles_y = grid.tiles_y(),
        tile = grid.tile_width(),
        tile_bytes = layout.pixel_bytes() as u64
            * grid.tile_width() as u64
            * grid.tile_height() as u64,
        "Tile grid"
    );

    // Paint the canvas tile by tile from the source.
    let start = Instant::now();
    for pos in grid.positions() {
        let tile = reader.tile(pos.x, pos.y)?;
        canvas.set_data(tile.into_raster())?;
    }
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "Canvas painted");

    // Read everything back; most tiles come from the spill directory.
    let start = Instant::now();
    let mut mismatches = 0u64;
    for pos in grid.positions() {
        let tile = canvas.tile(pos.x, pos.y)?;
        if *tile.raster() != pattern.render(0, grid.tile_bounds(pos)) {
            warn!(%pos, "Tile contents differ from source");
            mismatches += 1;
        }
    }
    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        decodes = pattern.decode_count(),
        "Canvas verified"
    );
    anyhow::ensure!(mismatches == 0, "{mismatches} tiles differ from the source");

    for snapshot in manager.stats() {
        info!(
            image = %snapshot.image,
            stats = %serde_json::to_string(&snapshot)?,
            hit_rate = snapshot.stats.hit_rate(),
            "Store statistics"
        );
    }

    reader.dispose()?;
    canvas.dispose()?;
    info!(images = manager.image_count(), "Done");

    Ok(())
}
