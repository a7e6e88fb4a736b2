//! A bounded LRU cache of decoded tiles and the stream session that wraps
//! it with hit/miss accounting.
//!
//! Not thread-safe: a stream session is owned by one thread, per the
//! crate's concurrency model.

use std::path::PathBuf;

use lru::LruCache;
use ndarray::Array4;

use crate::error::CivdResult;
use crate::geometry::{self, Roi};
use crate::index::Index;
use crate::packet::Mode;
use crate::tile_store::{self, TileLocation};
use crate::world::World;

/// Default tile cache capacity for a new [`StreamSession`].
pub const DEFAULT_CAPACITY: usize = 128;

/// Cache key: the physical location a tile's bytes resolve to, not
/// `(snapshot, tile_id)`. A reference entry and the base tile it points at
/// resolve to the same `(pack_path, offset)` pair, so a tile carried
/// forward unchanged across a [`StreamSession::retarget`] lands on the same
/// key and hits; a genuinely changed tile resolves to a new pack offset and
/// misses. No invalidation logic is needed on retarget.
type CacheKey = (PathBuf, u64);

fn cache_key(location: &TileLocation) -> CacheKey {
    (location.pack_path.clone(), location.offset)
}

/// Per-call statistics for a stream operation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    pub hits: u64,
    pub misses: u64,
    pub bytes_read: u64,
    pub decode_ms: f64,
}

/// A bounded cache of decoded tiles, keyed by resolved physical location.
pub struct TileCache {
    inner: LruCache<CacheKey, Array4<f32>>,
    /// `tile_id -> (key, tile_coord)` for every entry currently cached,
    /// kept only so [`TileCache::unload_roi`] can test ROI intersection
    /// without round-tripping pack bytes back into coordinates.
    locations: std::collections::HashMap<String, (CacheKey, (u32, u32, u32))>,
}

impl TileCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1 above");
        Self {
            inner: LruCache::new(capacity),
            locations: std::collections::HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn get(&mut self, key: &CacheKey) -> Option<&Array4<f32>> {
        self.inner.get(key)
    }

    fn put(&mut self, tile_id: &str, tile_coord: (u32, u32, u32), key: CacheKey, value: Array4<f32>) {
        self.locations.insert(tile_id.to_string(), (key.clone(), tile_coord));
        self.inner.put(key, value);
    }

    /// Evict every cached tile whose bounds intersect `roi`.
    pub fn unload_roi(&mut self, roi: Roi, tile_size: i64) -> usize {
        let to_evict: Vec<(String, CacheKey)> = self
            .locations
            .iter()
            .filter(|(_, (_, coord))| geometry::intersect(geometry::tile_bounds(*coord, tile_size), roi).is_some())
            .map(|(tile_id, (key, _))| (tile_id.clone(), key.clone()))
            .collect();
        let n = to_evict.len();
        for (tile_id, key) in to_evict {
            self.inner.pop(&key);
            self.locations.remove(&tile_id);
        }
        n
    }
}

/// A long-lived streaming session over one snapshot, backed by a
/// [`TileCache`] that can be carried forward across snapshots via
/// [`StreamSession::retarget`].
pub struct StreamSession<'w> {
    world: &'w World,
    snapshot: String,
    cache: TileCache,
}

impl<'w> StreamSession<'w> {
    #[must_use]
    pub fn new(world: &'w World, snapshot: impl Into<String>, capacity: usize) -> Self {
        Self {
            world,
            snapshot: snapshot.into(),
            cache: TileCache::new(capacity),
        }
    }

    #[must_use]
    pub fn stats_cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Point this session at a different snapshot, keeping the underlying
    /// cache. Safe only when the caller guarantees id semantics coincide
    /// (same grid, same `tile_size`) across the two snapshots.
    pub fn retarget(&mut self, snapshot: impl Into<String>) {
        self.snapshot = snapshot.into();
    }

    /// Load every tile touching `roi` for the current snapshot, in full
    /// mode.
    pub fn load_region(&mut self, roi: Roi) -> CivdResult<StreamStats> {
        self.load_tiles(roi, Mode::Full)
    }

    /// Load only the tiles that carry their own payload at the current
    /// snapshot (changed-since-base tiles) within `roi`.
    pub fn apply_delta(&mut self, roi: Roi) -> CivdResult<StreamStats> {
        self.load_tiles(roi, Mode::Delta)
    }

    fn load_tiles(&mut self, roi: Roi, mode: Mode) -> CivdResult<StreamStats> {
        let index = Index::load(&self.world.snapshot_dir(&self.snapshot).join("index.json"))?;
        let roi = geometry::clamp_roi(
            roi,
            (index.shape_zyxc[0], index.shape_zyxc[1], index.shape_zyxc[2]),
        );
        let tile_ids = geometry::roi_tile_ids(roi, index.tile_size);

        let mut stats = StreamStats::default();
        for coord in tile_ids {
            let tile_id = geometry::tile_id_string(coord);
            let Some(entry) = index.find_by_id(&tile_id) else {
                continue;
            };
            if mode == Mode::Delta && !entry.has_own_payload() {
                continue;
            }

            let snapshot_dir_for = |snap: &str| Ok(self.world.snapshot_dir(snap).join("tiles.zstpack"));
            let location = tile_store::resolve_location(entry, &index, snapshot_dir_for);
            let key = cache_key(&location);
            if self.cache.get(&key).is_some() {
                stats.hits += 1;
                continue;
            }

            stats.misses += 1;
            let start = std::time::Instant::now();
            let array = tile_store::decode_at(entry, &location)?;
            stats.decode_ms += start.elapsed().as_secs_f64() * 1000.0;
            stats.bytes_read += location.length;
            self.cache.put(&tile_id, coord, key, array);
        }
        Ok(stats)
    }

    /// Evict every cached tile that intersects `roi`. Returns the number of
    /// tiles evicted.
    pub fn unload_region(&mut self, roi: Roi, tile_size: i64) -> usize {
        self.cache.unload_roi(roi, tile_size)
    }

    pub fn pack_path(&self) -> std::path::PathBuf {
        self.world.snapshot_dir(&self.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer;
    use ndarray::Array4;

    fn write_snapshot(world: &World, name: &str, volume: &Array4<f32>, base: Option<&str>) {
        let snap_dir = world.snapshot_dir(name);
        let base_index = base.map(|n| Index::load(&world.snapshot_dir(n).join("index.json")).unwrap());
        let (index, _) = writer::build_snapshot(volume, 32, 3, &snap_dir, base_index.as_ref(), base).unwrap();
        writer::commit_index(&index, &snap_dir).unwrap();
    }

    fn key(offset: u64) -> CacheKey {
        (PathBuf::from("pack.zstpack"), offset)
    }

    #[test]
    fn cache_respects_capacity() {
        let mut cache = TileCache::new(2);
        cache.put("a", (0, 0, 0), key(0), Array4::zeros((1, 1, 1, 1)));
        cache.put("b", (0, 0, 1), key(16), Array4::zeros((1, 1, 1, 1)));
        cache.put("c", (0, 0, 2), key(32), Array4::zeros((1, 1, 1, 1)));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(0)).is_none());
    }

    #[test]
    fn get_promotes_to_most_recently_used() {
        let mut cache = TileCache::new(2);
        cache.put("a", (0, 0, 0), key(0), Array4::zeros((1, 1, 1, 1)));
        cache.put("b", (0, 0, 1), key(16), Array4::zeros((1, 1, 1, 1)));
        assert!(cache.get(&key(0)).is_some());
        cache.put("c", (0, 0, 2), key(32), Array4::zeros((1, 1, 1, 1)));
        // "b" was least recently used after touching "a"; it should be evicted.
        assert!(cache.get(&key(16)).is_none());
        assert!(cache.get(&key(0)).is_some());
    }

    #[test]
    fn stream_session_reports_hits_after_warming() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::open(dir.path());
        let volume = Array4::<f32>::zeros((64, 32, 32, 1));
        write_snapshot(&world, "t000", &volume, None);

        let roi = Roi::new(0, 64, 0, 32, 0, 32);
        let mut session = StreamSession::new(&world, "t000", DEFAULT_CAPACITY);
        let first = session.load_region(roi).unwrap();
        assert_eq!(first.misses, 2);
        assert_eq!(first.hits, 0);

        let second = session.load_region(roi).unwrap();
        assert_eq!(second.hits, 2);
        assert_eq!(second.misses, 0);
        assert_eq!(second.bytes_read, 0);
    }

    #[test]
    fn unload_region_evicts_intersecting_tiles_only() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::open(dir.path());
        let volume = Array4::<f32>::zeros((64, 32, 32, 1));
        write_snapshot(&world, "t000", &volume, None);

        let mut session = StreamSession::new(&world, "t000", DEFAULT_CAPACITY);
        session.load_region(Roi::new(0, 64, 0, 32, 0, 32)).unwrap();
        assert_eq!(session.stats_cache_len(), 2);

        let evicted = session.unload_region(Roi::new(0, 32, 0, 32, 0, 32), 32);
        assert_eq!(evicted, 1);
        assert_eq!(session.stats_cache_len(), 1);
    }

    #[test]
    fn retarget_carries_cache_forward_and_reports_hits_for_unchanged_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::open(dir.path());
        let mut volume = Array4::<f32>::zeros((64, 32, 32, 1));
        write_snapshot(&world, "t000", &volume, None);
        volume[[40, 0, 0, 0]] = 7.0;
        write_snapshot(&world, "t001", &volume, Some("t000"));

        let roi = Roi::new(0, 64, 0, 32, 0, 32);
        let mut session = StreamSession::new(&world, "t000", DEFAULT_CAPACITY);
        session.load_region(roi).unwrap();

        session.retarget("t001");
        let stats = session.load_region(roi).unwrap();
        // The unchanged tile resolves to the same base pack offset it did
        // under t000 and hits; only the genuinely changed tile, now local
        // to t001's own pack, misses.
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
