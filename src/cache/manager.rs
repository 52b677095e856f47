//! Cache manager: one memory budget shared by many images.
//!
//! The manager maps image identities to [`TileStore`]s and splits the
//! global capacity equally between them. Adding or removing an image
//! rebalances every store at once, which can spill tiles of unrelated
//! images when a new one joins.
//!
//! Locking: the registry mutex guards the identity map and is held for
//! structural changes. Each store has its own mutex; tile operations take
//! only that one. Rebalancing locks stores in ascending identity order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::codec::{RawTileCodec, TileCodec};
use crate::cache::shard::DirectoryShard;
use crate::cache::store::{StoreError, StoreStats, TileStore};
use crate::cache::tile::{Tile, TilePos};
use crate::config::{Config, SpillConfig, TilingConfig};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Unknown image {0}")]
    UnknownImage(ImageId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    pub fn is_storage_io(&self) -> bool {
        matches!(self, CacheError::Store(e) if e.is_storage_io())
    }
}

/// Identity of one image registered with a [`CacheManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ImageId(Uuid);

impl ImageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread-safe handle to one image's store.
pub type SharedStore = Arc<Mutex<TileStore>>;

/// Point-in-time view of one store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub image: ImageId,
    pub capacity: u64,
    pub remaining: u64,
    pub resident_tiles: usize,
    pub stats: StoreStats,
}

struct Registry {
    global_capacity: u64,
    stores: BTreeMap<ImageId, SharedStore>,
}

/// Owner of every image's tile store and of the shared memory budget.
pub struct CacheManager {
    registry: Mutex<Registry>,
    spill: SpillConfig,
    tiling: TilingConfig,
    codec: Arc<dyn TileCodec>,
}

impl CacheManager {
    /// Create a manager using the configured spill codec.
    pub fn new(config: &Config) -> Self {
        Self::with_codec(config, Arc::new(RawTileCodec::from_config(config)))
    }

    /// Create a manager with a caller-supplied spill codec.
    pub fn with_codec(config: &Config, codec: Arc<dyn TileCodec>) -> Self {
        Self {
            registry: Mutex::new(Registry {
                global_capacity: config.cache.global_capacity,
                stores: BTreeMap::new(),
            }),
            spill: config.spill.clone(),
            tiling: config.tiling.clone(),
            codec,
        }
    }

    /// Return the store for `image`, creating it for a `nb_x × nb_y` tile
    /// grid if needed.
    ///
    /// A new store gets `global_capacity / (count + 1)` bytes and every
    /// existing store is shrunk to the same share.
    pub fn get_or_create(
        &self,
        image: ImageId,
        nb_x: u32,
        nb_y: u32,
    ) -> Result<SharedStore, CacheError> {
        let mut registry = self.registry.lock();
        if let Some(store) = registry.stores.get(&image) {
            return Ok(store.clone());
        }

        let share = registry.global_capacity / (registry.stores.len() as u64 + 1);
        let shard = DirectoryShard::new(
            self.spill.root.join(image.to_string()),
            nb_x,
            nb_y,
            self.codec.extension(),
            self.spill.delete_on_exit,
        )
        .map_err(StoreError::from)?;
        let store = TileStore::new(image.to_string(), share, shard, self.codec.clone())?;

        rebalance(&registry.stores, share)?;
        let store = Arc::new(Mutex::new(store));
        registry.stores.insert(image, store.clone());

        info!(
            %image,
            nb_x,
            nb_y,
            share,
            images = registry.stores.len(),
            "Registered image store"
        );
        Ok(store)
    }

    /// Look up a tile, promoting it from disk if spilled. Returns a copy.
    pub fn get(&self, image: ImageId, pos: TilePos) -> Result<Option<Tile>, CacheError> {
        let store = self.store(image)?;
        let mut store = store.lock();
        Ok(store.get(pos)?.cloned())
    }

    /// Run `f` on the tile in place, promoting it from disk if spilled.
    ///
    /// `f` runs while the image's store is locked: it must not call back
    /// into this manager for the same image, or it deadlocks.
    pub fn with_tile_mut<R>(
        &self,
        image: ImageId,
        pos: TilePos,
        f: impl FnOnce(&mut Tile) -> R,
    ) -> Result<Option<R>, CacheError> {
        let store = self.store(image)?;
        let mut store = store.lock();
        Ok(store.get_mut(pos)?.map(f))
    }

    pub fn insert(&self, image: ImageId, tile: Tile) -> Result<(), CacheError> {
        let store = self.store(image)?;
        let mut store = store.lock();
        Ok(store.insert(tile)?)
    }

    pub fn remove(&self, image: ImageId, pos: TilePos) -> Result<Option<Tile>, CacheError> {
        let store = self.store(image)?;
        let mut store = store.lock();
        Ok(store.remove(pos)?)
    }

    /// Dispose an image's store (memory and disk) and hand its share back
    /// to the remaining images.
    ///
    /// The image is unregistered and its share redistributed even when
    /// deleting its spill directory fails; that failure is returned after.
    pub fn remove_all(&self, image: ImageId) -> Result<(), CacheError> {
        let mut registry = self.registry.lock();
        let store = registry
            .stores
            .remove(&image)
            .ok_or(CacheError::UnknownImage(image))?;
        let disposed = store.lock().dispose_all();

        let count = registry.stores.len() as u64;
        if count > 0 {
            let share = registry.global_capacity / count;
            rebalance(&registry.stores, share)?;
        }

        if let Err(e) = disposed {
            warn!(%image, error = %e, "Image store removed, spill cleanup failed");
            return Err(e.into());
        }
        info!(%image, images = count, "Removed image store");
        Ok(())
    }

    /// Change the shared budget and rebalance every store.
    pub fn set_global_capacity(&self, bytes: u64) -> Result<(), CacheError> {
        let mut registry = self.registry.lock();
        registry.global_capacity = bytes;

        let count = registry.stores.len() as u64;
        if count > 0 {
            rebalance(&registry.stores, bytes / count)?;
        }
        info!(global_capacity = bytes, images = count, "Global capacity changed");
        Ok(())
    }

    /// Tile size limits applied by the image facades.
    pub fn tiling(&self) -> &TilingConfig {
        &self.tiling
    }

    pub fn global_capacity(&self) -> u64 {
        self.registry.lock().global_capacity
    }

    pub fn image_count(&self) -> usize {
        self.registry.lock().stores.len()
    }

    pub fn contains(&self, image: ImageId) -> bool {
        self.registry.lock().stores.contains_key(&image)
    }

    /// Current budget of one image's store.
    pub fn capacity_of(&self, image: ImageId) -> Result<u64, CacheError> {
        Ok(self.store(image)?.lock().capacity())
    }

    /// Snapshot of every store, in identity order.
    pub fn stats(&self) -> Vec<StoreSnapshot> {
        let stores: Vec<(ImageId, SharedStore)> = self
            .registry
            .lock()
            .stores
            .iter()
            .map(|(id, store)| (*id, store.clone()))
            .collect();

        stores
            .into_iter()
            .map(|(image, store)| {
                let store = store.lock();
                StoreSnapshot {
                    image,
                    capacity: store.capacity(),
                    remaining: store.remaining(),
                    resident_tiles: store.resident_count(),
                    stats: store.stats().clone(),
                }
            })
            .collect()
    }

    fn store(&self, image: ImageId) -> Result<SharedStore, CacheError> {
        self.registry
            .lock()
            .stores
            .get(&image)
            .cloned()
            .ok_or(CacheError::UnknownImage(image))
    }
}

/// Set every store to `share` bytes, in ascending identity order.
fn rebalance(stores: &BTreeMap<ImageId, SharedStore>, share: u64) -> Result<(), StoreError> {
    for store in stores.values() {
        store.lock().set_capacity(share)?;
    }
    Ok(())
}
