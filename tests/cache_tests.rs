//! Integration tests for the multi-image cache manager.

use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use tiled_raster_cache::{
    CacheError, CacheManager, Config, ElementKind, ImageId, PixelLayout, Raster, Region, Tile,
    TilePos,
};

fn make_manager(tmp: &TempDir, capacity: u64) -> CacheManager {
    let mut config = Config::default();
    config.cache.global_capacity = capacity;
    config.spill.root = tmp.path().to_path_buf();
    CacheManager::new(&config)
}

fn gray_tile(x: u32, y: u32, edge: u32, value: u8) -> Tile {
    let region = Region::new(x as i64 * edge as i64, y as i64 * edge as i64, edge, edge);
    let mut raster = Raster::blank(region, PixelLayout::gray(ElementKind::U8));
    raster.fill(value).unwrap();
    Tile::new(TilePos::new(x, y), raster)
}

#[test]
fn test_rebalance_is_immediate() {
    let tmp = TempDir::new().unwrap();
    let manager = make_manager(&tmp, 1000);
    let a = ImageId::new();
    let b = ImageId::new();

    manager.get_or_create(a, 8, 8).unwrap();
    manager.get_or_create(b, 8, 8).unwrap();
    assert_eq!(manager.capacity_of(a).unwrap(), 500);
    assert_eq!(manager.capacity_of(b).unwrap(), 500);

    manager.remove_all(a).unwrap();
    assert_eq!(manager.capacity_of(b).unwrap(), 1000);
    assert_eq!(manager.image_count(), 1);
}

#[test]
fn test_three_way_split_rounds_down() {
    let tmp = TempDir::new().unwrap();
    let manager = make_manager(&tmp, 1000);
    let ids: Vec<ImageId> = (0..3).map(|_| ImageId::new()).collect();
    for id in &ids {
        manager.get_or_create(*id, 2, 2).unwrap();
    }
    for id in &ids {
        assert_eq!(manager.capacity_of(*id).unwrap(), 333);
    }
}

#[test]
fn test_joining_image_spills_existing_tiles() {
    let tmp = TempDir::new().unwrap();
    let manager = make_manager(&tmp, 4 * 64);
    let a = ImageId::new();
    manager.get_or_create(a, 4, 4).unwrap();
    for x in 0..4 {
        manager.insert(a, gray_tile(x, 0, 8, x as u8 + 1)).unwrap();
    }

    let b = ImageId::new();
    manager.get_or_create(b, 4, 4).unwrap();
    let stats = manager.stats();
    let snapshot = stats.iter().find(|s| s.image == a).unwrap();
    assert_eq!(snapshot.resident_tiles, 2);
    assert_eq!(snapshot.remaining, 0);

    // Spilled tiles of the first image still read back.
    for x in 0..4 {
        let tile = manager.get(a, TilePos::new(x, 0)).unwrap().unwrap();
        assert!(tile.raster().data().iter().all(|&v| v == x as u8 + 1));
    }
}

#[test]
fn test_images_do_not_share_tiles() {
    let tmp = TempDir::new().unwrap();
    let manager = make_manager(&tmp, 1 << 20);
    let a = ImageId::new();
    let b = ImageId::new();
    manager.get_or_create(a, 2, 2).unwrap();
    manager.get_or_create(b, 2, 2).unwrap();

    manager.insert(a, gray_tile(0, 0, 8, 7)).unwrap();
    assert!(manager.get(b, TilePos::new(0, 0)).unwrap().is_none());
    assert!(manager.remove(a, TilePos::new(0, 0)).unwrap().is_some());
    assert!(manager.get(a, TilePos::new(0, 0)).unwrap().is_none());
}

#[test]
fn test_removed_image_is_unknown() {
    let tmp = TempDir::new().unwrap();
    let manager = make_manager(&tmp, 1000);
    let a = ImageId::new();
    manager.get_or_create(a, 2, 2).unwrap();
    manager.remove_all(a).unwrap();

    assert!(!manager.contains(a));
    assert!(matches!(
        manager.insert(a, gray_tile(0, 0, 4, 0)),
        Err(CacheError::UnknownImage(id)) if id == a
    ));
}

#[test]
fn test_out_of_grid_tile_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let manager = make_manager(&tmp, 1 << 20);
    let a = ImageId::new();
    manager.get_or_create(a, 2, 2).unwrap();
    let err = manager.insert(a, gray_tile(2, 0, 4, 0)).unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
    assert!(!err.is_storage_io());
}

#[test]
fn test_concurrent_images() {
    let tmp = TempDir::new().unwrap();
    let manager = Arc::new(make_manager(&tmp, 16 * 256));

    let handles: Vec<_> = (0..4u8)
        .map(|worker| {
            let manager = manager.clone();
            thread::spawn(move || {
                let id = ImageId::new();
                manager.get_or_create(id, 8, 8).unwrap();
                for y in 0..8 {
                    for x in 0..8 {
                        manager.insert(id, gray_tile(x, y, 16, worker)).unwrap();
                    }
                }
                for y in 0..8 {
                    for x in 0..8 {
                        let tile = manager.get(id, TilePos::new(x, y)).unwrap().unwrap();
                        assert!(tile.raster().data().iter().all(|&v| v == worker));
                    }
                }
                id
            })
        })
        .collect();

    let ids: Vec<ImageId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(manager.image_count(), 4);
    for snapshot in manager.stats() {
        assert!(snapshot.remaining <= snapshot.capacity);
        assert_eq!(snapshot.capacity, 1024);
    }
    for id in ids {
        manager.remove_all(id).unwrap();
    }
    assert_eq!(manager.image_count(), 0);
}
