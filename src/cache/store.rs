//! Per-image tile store.
//!
//! A store owns the resident tiles of one image, oldest first, and a byte
//! budget. Inserting beyond the budget spills the oldest tiles to the
//! image's [`DirectoryShard`]; reading a spilled tile decodes it and
//! re-inserts it, which may spill others in turn.
//!
//! Eviction is FIFO: a hit on a resident tile does not reorder it.
//!
//! Accounting invariant, between operations:
//!
//! ```text
//! used == sum(resident weights) <= capacity
//! remaining == capacity - used
//! ```

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::codec::{CodecError, TileCodec};
use crate::cache::shard::{DirectoryShard, ShardError};
use crate::cache::tile::{Tile, TilePos};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Tile {pos} weighs {weight} bytes, more than the store capacity of {capacity} bytes")]
    TileTooLarge {
        pos: TilePos,
        weight: u64,
        capacity: u64,
    },

    #[error("Spill codec failed for tile {pos}: {source}")]
    Codec {
        pos: TilePos,
        #[source]
        source: CodecError,
    },

    #[error("Spill storage I/O failed at {path}: {source}")]
    StorageIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Shard(#[from] ShardError),
}

impl StoreError {
    /// Whether this error came from the disk rather than from accounting.
    pub fn is_storage_io(&self) -> bool {
        matches!(
            self,
            StoreError::StorageIo { .. }
                | StoreError::Codec {
                    source: CodecError::Io { .. },
                    ..
                }
                | StoreError::Shard(ShardError::Io { .. })
        )
    }
}

/// Counters for one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Reads served from memory.
    pub hits: u64,
    /// Reads that found neither a resident tile nor a spill file.
    pub misses: u64,
    /// Spilled tiles decoded back into memory.
    pub promotions: u64,
    /// Tiles moved out of memory.
    pub evictions: u64,
    /// Evictions that wrote a spill file.
    pub spill_writes: u64,
    /// Evictions of clean tiles whose spill file already existed.
    pub spill_skips: u64,
    /// Explicit removals.
    pub removals: u64,
}

impl StoreStats {
    /// Fraction of successful reads served without touching disk.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.promotions;
        if served == 0 {
            return 0.0;
        }
        self.hits as f64 / served as f64
    }
}

/// Memory-bounded tile collection of one image with disk spillover.
pub struct TileStore {
    /// Identifies the owning image in logs.
    label: String,

    /// Byte budget for resident tiles.
    capacity: u64,

    /// Sum of resident tile weights; exceeds `capacity` only inside `set_capacity`.
    used: u64,

    /// Resident tiles; the LRU end is the oldest insertion.
    resident: LruCache<TilePos, Tile>,

    shard: DirectoryShard,

    codec: Arc<dyn TileCodec>,

    stats: StoreStats,
}

impl TileStore {
    /// Create a store and eagerly build its spill directory tree.
    pub fn new(
        label: impl Into<String>,
        capacity: u64,
        shard: DirectoryShard,
        codec: Arc<dyn TileCodec>,
    ) -> Result<Self, StoreError> {
        shard.create()?;
        Ok(Self {
            label: label.into(),
            capacity,
            used: 0,
            resident: LruCache::unbounded(),
            shard,
            codec,
            stats: StoreStats::default(),
        })
    }

    /// Add a tile, spilling the oldest resident tiles until it fits.
    ///
    /// A tile already resident at the same position is replaced. If the new
    /// tile cannot be admitted the old one stays resident.
    pub fn insert(&mut self, tile: Tile) -> Result<(), StoreError> {
        let pos = tile.pos();
        self.check_bounds(pos)?;
        if tile.weight() > self.capacity {
            return Err(StoreError::TileTooLarge {
                pos,
                weight: tile.weight(),
                capacity: self.capacity,
            });
        }

        let replaced = self.resident.pop(&pos);
        if let Some(old) = &replaced {
            self.used -= old.weight();
        }
        if let Err(e) = self.admit(tile) {
            // Evictions only freed space, so the old tile fits again.
            if let Some(old) = replaced {
                self.used += old.weight();
                self.resident.push(pos, old);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Look up a tile, promoting it from disk if it was spilled.
    ///
    /// Returns `None` when the tile is neither resident nor spilled.
    pub fn get(&mut self, pos: TilePos) -> Result<Option<&Tile>, StoreError> {
        if !self.ensure_resident(pos)? {
            return Ok(None);
        }
        Ok(self.resident.peek(&pos))
    }

    /// Like [`TileStore::get`], for in-place mutation.
    pub fn get_mut(&mut self, pos: TilePos) -> Result<Option<&mut Tile>, StoreError> {
        if !self.ensure_resident(pos)? {
            return Ok(None);
        }
        Ok(self.resident.peek_mut(&pos))
    }

    /// Drop a tile from memory and delete its spill file, whichever exist.
    pub fn remove(&mut self, pos: TilePos) -> Result<Option<Tile>, StoreError> {
        self.check_bounds(pos)?;
        let removed = self.resident.pop(&pos);
        if let Some(tile) = &removed {
            self.used -= tile.weight();
        }

        let path = self.shard.path(pos.x, pos.y)?;
        match fs::remove_file(&path) {
            Ok(()) => debug!(store = %self.label, %pos, "Deleted spill file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(StoreError::StorageIo { path, source }),
        }

        self.stats.removals += 1;
        Ok(removed)
    }

    /// Change the budget, spilling the oldest tiles if it shrank below usage.
    pub fn set_capacity(&mut self, capacity: u64) -> Result<(), StoreError> {
        self.capacity = capacity;

        let mut evicted = 0;
        while self.used > self.capacity {
            if !self.evict_oldest()? {
                break;
            }
            evicted += 1;
        }

        debug!(
            store = %self.label,
            capacity,
            used = self.used,
            evicted,
            "Store capacity changed"
        );
        Ok(())
    }

    /// Forget every resident tile and delete the spill tree.
    pub fn dispose_all(&mut self) -> Result<(), StoreError> {
        let dropped = self.resident.len();
        self.resident.clear();
        self.used = 0;
        self.shard.dispose()?;
        info!(store = %self.label, dropped, "Disposed tile store");
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes still free in the budget.
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Sum of resident tile weights.
    pub fn resident_weight(&self) -> u64 {
        self.resident.iter().map(|(_, tile)| tile.weight()).sum()
    }

    /// Resident positions, oldest first.
    pub fn resident_positions(&self) -> Vec<TilePos> {
        self.resident.iter().rev().map(|(pos, _)| *pos).collect()
    }

    pub fn is_resident(&self, pos: TilePos) -> bool {
        self.resident.contains(&pos)
    }

    /// Whether a spill file exists for `pos`.
    pub fn is_spilled(&self, pos: TilePos) -> Result<bool, StoreError> {
        Ok(self.spill_file(pos)?.1)
    }

    pub fn shard(&self) -> &DirectoryShard {
        &self.shard
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    fn check_bounds(&self, pos: TilePos) -> Result<(), StoreError> {
        let (nb_x, nb_y) = self.shard.grid();
        if pos.x >= nb_x || pos.y >= nb_y {
            return Err(ShardError::Exhausted {
                x: pos.x,
                y: pos.y,
                nb_x,
                nb_y,
            }
            .into());
        }
        Ok(())
    }

    /// Spill path for `pos` and whether a file is there. A failed stat is a
    /// storage error, not an absent file.
    fn spill_file(&self, pos: TilePos) -> Result<(PathBuf, bool), StoreError> {
        let path = self.shard.path(pos.x, pos.y)?;
        match path.try_exists() {
            Ok(exists) => Ok((path, exists)),
            Err(source) => Err(StoreError::StorageIo { path, source }),
        }
    }

    /// Make `pos` resident if it is in memory or on disk.
    fn ensure_resident(&mut self, pos: TilePos) -> Result<bool, StoreError> {
        if self.resident.contains(&pos) {
            self.stats.hits += 1;
            return Ok(true);
        }

        let (path, exists) = self.spill_file(pos)?;
        if !exists {
            self.stats.misses += 1;
            return Ok(false);
        }

        let mut tile = self
            .codec
            .decode(pos, &path)
            .map_err(|source| StoreError::Codec { pos, source })?;
        tile.mark_clean();
        self.admit(tile)?;

        self.stats.promotions += 1;
        debug!(store = %self.label, %pos, "Promoted tile from disk");
        Ok(true)
    }

    fn admit(&mut self, tile: Tile) -> Result<(), StoreError> {
        let pos = tile.pos();
        let weight = tile.weight();

        while self.used.saturating_add(weight) > self.capacity {
            if !self.evict_oldest()? {
                return Err(StoreError::TileTooLarge {
                    pos,
                    weight,
                    capacity: self.capacity,
                });
            }
        }

        self.used += weight;
        self.resident.push(pos, tile);
        Ok(())
    }

    /// Spill the oldest resident tile. Returns `false` when none is resident.
    ///
    /// The tile leaves memory only after its spill file is written.
    fn evict_oldest(&mut self) -> Result<bool, StoreError> {
        let Some((&pos, tile)) = self.resident.peek_lru() else {
            return Ok(false);
        };

        let (path, exists) = self.spill_file(pos)?;
        let written = tile.is_dirty() || !exists;
        if written {
            self.codec
                .encode(tile, &path)
                .map_err(|source| StoreError::Codec { pos, source })?;
            self.stats.spill_writes += 1;
        } else {
            self.stats.spill_skips += 1;
        }

        if let Some((_, tile)) = self.resident.pop_lru() {
            self.used -= tile.weight();
        }
        self.stats.evictions += 1;

        debug!(
            store = %self.label,
            %pos,
            written,
            used = self.used,
            "Evicted tile"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::RawTileCodec;
    use crate::cache::tile::{PixelLayout, Raster, Region};
    use crate::cache::weight::ElementKind;
    use crate::config::CompressionConfig;
    use tempfile::TempDir;

    const TILE_WEIGHT: u64 = 256 * 256;

    fn test_store(tmp: &TempDir, capacity: u64) -> TileStore {
        let shard = DirectoryShard::new(tmp.path().join("img"), 8, 8, "tile", false).unwrap();
        let codec = Arc::new(RawTileCodec::new(CompressionConfig::default(), "tile"));
        TileStore::new("test", capacity, shard, codec).unwrap()
    }

    fn tile(x: u32, y: u32, value: u8) -> Tile {
        let region = Region::new(x as i64 * 256, y as i64 * 256, 256, 256);
        let mut raster = Raster::blank(region, PixelLayout::gray(ElementKind::U8));
        raster.fill(value).unwrap();
        Tile::new(TilePos::new(x, y), raster)
    }

    fn assert_accounting(store: &TileStore) {
        let weights = store.resident_weight();
        assert_eq!(store.used, weights);
        assert!(weights <= store.capacity());
        assert_eq!(store.remaining() + weights, store.capacity());
    }

    #[test]
    fn test_fifo_eviction_keeps_three_tiles() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, 200_000);

        for x in 0..3 {
            store.insert(tile(x, 0, x as u8)).unwrap();
            assert_accounting(&store);
        }
        assert_eq!(store.resident_count(), 3);
        assert_eq!(store.remaining(), 200_000 - 3 * TILE_WEIGHT);

        store.insert(tile(3, 0, 3)).unwrap();
        assert_accounting(&store);
        assert_eq!(store.resident_count(), 3);
        assert!(!store.is_resident(TilePos::new(0, 0)));
        assert!(store.is_spilled(TilePos::new(0, 0)).unwrap());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_hit_does_not_reorder() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, 200_000);
        for x in 0..3 {
            store.insert(tile(x, 0, 1)).unwrap();
        }

        store.get(TilePos::new(0, 0)).unwrap().unwrap();
        store.insert(tile(3, 0, 1)).unwrap();

        assert!(!store.is_resident(TilePos::new(0, 0)));
        assert!(store.is_resident(TilePos::new(1, 0)));
    }

    #[test]
    fn test_promotion_restores_contents() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, 2 * TILE_WEIGHT);
        let original = tile(1, 1, 42);
        let expected = original.raster().clone();

        store.insert(original).unwrap();
        store.insert(tile(2, 1, 0)).unwrap();
        store.insert(tile(3, 1, 0)).unwrap();
        assert!(!store.is_resident(TilePos::new(1, 1)));

        let back = store.get(TilePos::new(1, 1)).unwrap().unwrap();
        assert_eq!(back.raster(), &expected);
        assert!(!back.is_dirty());
        assert_eq!(store.stats().promotions, 1);
        assert_accounting(&store);
        // promotion spilled the oldest remaining tile
        assert!(!store.is_resident(TilePos::new(2, 1)));
    }

    #[test]
    fn test_missing_tile_is_absent() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, TILE_WEIGHT);
        assert!(store.get(TilePos::new(5, 5)).unwrap().is_none());
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_tile_too_large() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, TILE_WEIGHT - 1);
        let err = store.insert(tile(0, 0, 0)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::TileTooLarge {
                weight: TILE_WEIGHT,
                ..
            }
        ));
        assert!(!err.is_storage_io());
        assert_accounting(&store);
    }

    #[test]
    fn test_clean_tile_is_not_rewritten() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, TILE_WEIGHT);
        store.insert(tile(0, 0, 9)).unwrap();
        store.insert(tile(1, 0, 9)).unwrap();
        assert_eq!(store.stats().spill_writes, 1);

        // promote (0,0), which spills (1,0); then spill (0,0) again
        store.get(TilePos::new(0, 0)).unwrap();
        store.get(TilePos::new(1, 0)).unwrap();
        assert_eq!(store.stats().spill_writes, 2);
        assert_eq!(store.stats().spill_skips, 1);
    }

    #[test]
    fn test_mutated_tile_is_rewritten() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, TILE_WEIGHT);
        store.insert(tile(0, 0, 1)).unwrap();
        store.insert(tile(1, 0, 1)).unwrap();

        let promoted = store.get_mut(TilePos::new(0, 0)).unwrap().unwrap();
        promoted.raster_mut().fill(77u8).unwrap();
        store.get(TilePos::new(1, 0)).unwrap();

        let back = store.get(TilePos::new(0, 0)).unwrap().unwrap();
        assert!(back.raster().data().iter().all(|&b| b == 77));
    }

    #[test]
    fn test_remove_frees_weight_and_file() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, TILE_WEIGHT);
        store.insert(tile(0, 0, 1)).unwrap();
        store.insert(tile(1, 0, 1)).unwrap();
        assert!(store.is_spilled(TilePos::new(0, 0)).unwrap());

        assert!(store.remove(TilePos::new(0, 0)).unwrap().is_none());
        assert!(!store.is_spilled(TilePos::new(0, 0)).unwrap());

        assert!(store.remove(TilePos::new(1, 0)).unwrap().is_some());
        assert_eq!(store.remaining(), TILE_WEIGHT);
        assert_accounting(&store);
    }

    #[test]
    fn test_shrinking_capacity_evicts_oldest() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, 4 * TILE_WEIGHT);
        for x in 0..4 {
            store.insert(tile(x, 0, 0)).unwrap();
        }

        store.set_capacity(TILE_WEIGHT + 10).unwrap();
        assert_accounting(&store);
        assert_eq!(store.resident_positions(), vec![TilePos::new(3, 0)]);
        assert_eq!(store.remaining(), 10);

        store.set_capacity(4 * TILE_WEIGHT).unwrap();
        assert_accounting(&store);
        assert_eq!(store.resident_count(), 1);
    }

    #[test]
    fn test_replacing_resident_tile() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, TILE_WEIGHT);
        store.insert(tile(0, 0, 1)).unwrap();
        store.insert(tile(0, 0, 2)).unwrap();
        assert_eq!(store.resident_count(), 1);
        assert_eq!(store.stats().evictions, 0);
        assert_accounting(&store);
    }

    fn small(x: u32, y: u32, edge: u32, value: u8) -> Tile {
        let region = Region::new(x as i64 * edge as i64, y as i64 * edge as i64, edge, edge);
        let mut raster = Raster::blank(region, PixelLayout::gray(ElementKind::U8));
        raster.fill(value).unwrap();
        Tile::new(TilePos::new(x, y), raster)
    }

    #[test]
    fn test_oversized_replacement_keeps_mutated_tile() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, 100);
        store.insert(small(0, 0, 8, 1)).unwrap();
        store.insert(small(1, 0, 8, 1)).unwrap();
        assert!(store.is_spilled(TilePos::new(0, 0)).unwrap());

        let promoted = store.get_mut(TilePos::new(0, 0)).unwrap().unwrap();
        promoted.raster_mut().fill(2u8).unwrap();

        let err = store.insert(small(0, 0, 16, 3)).unwrap_err();
        assert!(matches!(err, StoreError::TileTooLarge { weight: 256, .. }));
        assert!(store.is_resident(TilePos::new(0, 0)));
        assert_accounting(&store);

        let back = store.get(TilePos::new(0, 0)).unwrap().unwrap();
        assert_eq!(back.raster().data()[0], 2);
    }

    #[test]
    fn test_failed_replacement_restores_old_tile() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, 128);
        store.insert(small(0, 0, 8, 2)).unwrap();
        store.insert(small(1, 0, 8, 1)).unwrap();
        fs::remove_dir_all(tmp.path().join("img")).unwrap();

        // Making room for the bigger tile needs a spill, which cannot land.
        let bigger = Tile::new(
            TilePos::new(0, 0),
            Raster::blank(Region::new(0, 0, 8, 16), PixelLayout::gray(ElementKind::U8)),
        );
        let err = store.insert(bigger).unwrap_err();
        assert!(err.is_storage_io());
        assert_eq!(store.resident_count(), 2);
        assert_eq!(store.remaining(), 0);
        assert_accounting(&store);

        let back = store.get(TilePos::new(0, 0)).unwrap().unwrap();
        assert_eq!(back.raster().height(), 8);
        assert!(back.raster().data().iter().all(|&b| b == 2));
    }

    #[test]
    fn test_unbounded_capacity() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, u64::MAX);
        assert_eq!(store.remaining(), u64::MAX);

        store.insert(small(0, 0, 8, 1)).unwrap();
        assert_eq!(store.remaining(), u64::MAX - 64);
        assert_accounting(&store);

        store.set_capacity(u64::MAX - 1).unwrap();
        assert!(store.is_resident(TilePos::new(0, 0)));
        assert_accounting(&store);
    }

    #[test]
    fn test_out_of_grid_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, TILE_WEIGHT);
        assert!(matches!(
            store.insert(tile(8, 0, 0)),
            Err(StoreError::Shard(ShardError::Exhausted { .. }))
        ));
    }

    #[test]
    fn test_dispose_all_removes_tree() {
        let tmp = TempDir::new().unwrap();
        let mut store = test_store(&tmp, TILE_WEIGHT);
        store.insert(tile(0, 0, 1)).unwrap();
        store.insert(tile(1, 0, 1)).unwrap();

        store.dispose_all().unwrap();
        assert_eq!(store.resident_count(), 0);
        assert_eq!(store.remaining(), TILE_WEIGHT);
        assert!(!tmp.path().join("img").exists());
    }
}
