//! Benchmarks for the tile cache.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use tiled_raster_cache::cache::store::TileStore;
use tiled_raster_cache::cache::tile::TilePos;
use tiled_raster_cache::config::CompressionConfig;
use tiled_raster_cache::{DirectoryShard, ElementKind, PixelLayout, RawTileCodec, Raster, Region, Tile};

fn bench_shard_paths(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    // A 1M-tile grid; only path computation is measured.
    let shard = DirectoryShard::new(tmp.path(), 1024, 1024, "tile", false).unwrap();

    c.bench_function("shard_path_1k_of_1m", |b| {
        b.iter(|| {
            for i in 0..1024u32 {
                black_box(shard.path(black_box(i), black_box(1023 - i)).unwrap());
            }
        })
    });
}

fn bench_store_churn(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let shard = DirectoryShard::new(tmp.path().join("churn"), 16, 16, "tile", true).unwrap();
    let codec = Arc::new(RawTileCodec::new(CompressionConfig::default(), "tile"));
    // Room for 8 of the 256 tiles.
    let mut store = TileStore::new("bench", 8 * 64 * 64, shard, codec).unwrap();
    let layout = PixelLayout::gray(ElementKind::U8);

    let mut next = 0u32;
    c.bench_function("store_insert_evict_64x64", |b| {
        b.iter(|| {
            let pos = TilePos::new(next % 16, (next / 16) % 16);
            next = next.wrapping_add(1);
            let region = Region::new(pos.x as i64 * 64, pos.y as i64 * 64, 64, 64);
            store.insert(Tile::new(pos, Raster::blank(region, layout))).unwrap();
        })
    });

    c.bench_function("store_promote_64x64", |b| {
        b.iter(|| {
            let pos = TilePos::new(next % 16, (next / 16) % 16);
            next = next.wrapping_add(7);
            black_box(store.get(pos).unwrap().is_some());
        })
    });
}

fn bench_tile_weight(c: &mut Criterion) {
    c.bench_function("weight_all_kinds", |b| {
        b.iter(|| {
            for kind in ElementKind::ALL {
                black_box(tiled_raster_cache::cache::weight::weight(
                    black_box(kind),
                    256 * 3,
                    256,
                ));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_shard_paths,
    bench_store_churn,
    bench_tile_weight,
);
criterion_main!(benches);
