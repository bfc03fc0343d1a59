//! Tile-keyed elevation store.

use crate::{
    cache::{BoundedCache, CacheStats},
    resolve::Resolver,
    ElevationSample, ProfileBuffer, TerrainError,
};
use elevation::{round_coord, ElevationError, Elev, Tile, C};
use geo::geometry::Coord;
use log::{debug, warn};
use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

/// South-west corner of a tile, on the raster grid.
pub type TileKey = Coord<i32>;

pub(crate) const GEOTIFF_EXT: &str = "tif";
pub(crate) const FLATTENED_EXT: &str = "flt";

/// Returns the key of the `tile_size` tile containing the rounded
/// `coord`.
pub fn tile_key(Coord { x, y }: Coord<i32>, tile_size: i32) -> TileKey {
    Coord {
        x: x - x.rem_euclid(tile_size),
        y: y - y.rem_euclid(tile_size),
    }
}

/// Returns the file name used for the tile at `key`.
pub(crate) fn file_name(Coord { x, y }: TileKey, tile_size: i32, ext: &str) -> String {
    format!("{x}_{y}_{tile_size}.{ext}")
}

/// How to handle tile.
///
/// The trade off between loading tile data into memory versus memory
/// mapping is not obvious, and you should measure both before
/// deciding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileMode {
    /// Decode tile and load into memory.
    #[default]
    InMem,

    /// Memory map file contents, decoding on access.
    MemMap,
}

/// Where tiles came from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TileStats {
    /// Requests answered by the in-memory cache.
    pub from_memory: u64,
    /// Tiles read from a file already on disk.
    pub from_disk: u64,
    /// Tiles fetched from the map service.
    pub downloaded: u64,
    /// Download attempts rejected by the service quota.
    pub quota_failures: u64,
    /// Download attempts failing any other way.
    pub other_failures: u64,
}

pub struct TileStore {
    tiles: BoundedCache<TileKey, Tile>,
    source: TileSource,
}

/// Everything needed to produce a tile on a cache miss.
struct TileSource {
    tile_size: i32,
    resolver: Resolver,
    mode: TileMode,
    flatten_dir: Option<PathBuf>,
    stats: TileStats,
}

impl TileStore {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn builder() -> TileStoreBuilder {
        TileStoreBuilder {
            tile_size: None,
            resolver: None,
            capacity: Self::DEFAULT_CAPACITY,
            evict_batch: 1,
            mode: TileMode::default(),
            flatten_dir: None,
        }
    }

    pub fn tile_size(&self) -> i32 {
        self.source.tile_size
    }

    pub fn stats(&self) -> TileStats {
        self.source.stats
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.tiles.stats()
    }

    /// Number of tiles currently held in memory.
    pub fn resident(&self) -> usize {
        self.tiles.len()
    }

    pub fn key_for(&self, coord: Coord<C>) -> TileKey {
        tile_key(
            Coord {
                x: round_coord(coord.x),
                y: round_coord(coord.y),
            },
            self.source.tile_size,
        )
    }

    /// Returns the tile stored under `key`, loading it on a miss.
    ///
    /// The reference is only good until the next call on this store.
    pub fn tile(&mut self, key: TileKey) -> Result<&Tile, TerrainError> {
        let source = &mut self.source;
        if self.tiles.contains(&key) {
            source.stats.from_memory += 1;
        }
        self.tiles.get_or_try_insert_with(key, || source.load(key))
    }

    /// Returns the tile containing `coord`, loading it on a miss.
    pub fn tile_for(&mut self, coord: Coord<C>) -> Result<&Tile, TerrainError> {
        self.tile(self.key_for(coord))
    }

    pub fn altitude_at(&mut self, x: C, y: C) -> Result<Elev, TerrainError> {
        Ok(self.tile_for(Coord { x, y })?.altitude_at(x, y)?)
    }

    /// Fills `buf` with samples from `a` to `b` spaced at most
    /// `max_step` apart.
    ///
    /// The first sample is `a` and the last is exactly `b`. When
    /// `with_heights` is false elevations are left unresolved.
    pub fn fill_profile(
        &mut self,
        buf: &mut ProfileBuffer,
        a: Coord<C>,
        b: Coord<C>,
        max_step: C,
        with_heights: bool,
    ) -> Result<(), TerrainError> {
        if !(max_step.is_finite() && max_step > 0.0) {
            return Err(TerrainError::DegenerateGeometry(
                "step must be positive and finite",
            ));
        }
        let (dx, dy) = (b.x - a.x, b.y - a.y);
        let distance = dx.hypot(dy);
        if !(distance.is_finite() && distance > 0.0) {
            return Err(TerrainError::DegenerateGeometry(
                "profile endpoints must be distinct",
            ));
        }

        let now = Instant::now();
        let steps = (distance / max_step).ceil();
        let step = distance / steps;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let len = steps as usize + 1;
        let samples = buf.reset(len);
        let last = len - 1;
        for (n, sample) in samples.iter_mut().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let n_f = n as C;
            *sample = if n == last {
                ElevationSample::new(b.x, b.y)
            } else {
                let t = n_f / steps;
                ElevationSample::new(a.x + dx * t, a.y + dy * t)
            };
            sample.m = if n == last { distance } else { step * n_f };
        }
        let path_runtime = now.elapsed();

        if with_heights {
            self.resolve_samples(samples, false)?;
        }

        debug!(
            "profile; len: {len}, step: {step:.3}, exec: {:?} (path: {path_runtime:?})",
            now.elapsed()
        );
        Ok(())
    }

    /// Looks up elevations for the unresolved samples among the first
    /// `upto` of `buf` and returns how many were resolved.
    pub fn fill_altitudes(
        &mut self,
        buf: &mut ProfileBuffer,
        upto: usize,
    ) -> Result<usize, TerrainError> {
        let upto = upto.min(buf.len());
        self.resolve_samples(&mut buf[..upto], true)
    }

    /// Drops every cached tile.
    pub fn clear(&mut self) {
        self.tiles.clear();
    }
}

/// Private API.
impl TileStore {
    /// Holds on to one tile for as long as consecutive samples fall
    /// in it.
    fn resolve_samples(
        &mut self,
        samples: &mut [ElevationSample],
        skip_resolved: bool,
    ) -> Result<usize, TerrainError> {
        let mut resolved = 0;
        let mut i = 0;
        while i < samples.len() {
            if skip_resolved && samples[i].is_resolved() {
                i += 1;
                continue;
            }
            let coord = samples[i].rounded();
            let tile_size = self.source.tile_size;
            let tile = self.tile(tile_key(coord, tile_size))?;
            if !tile.contains_rounded(coord) {
                return Err(out_of_bounds(tile, coord).into());
            }
            while let Some(sample) = samples.get_mut(i) {
                if !(skip_resolved && sample.is_resolved()) {
                    match tile.get_rounded(sample.rounded()) {
                        Some(z) => sample.z = C::from(z),
                        None => break,
                    }
                    resolved += 1;
                }
                i += 1;
            }
        }
        Ok(resolved)
    }
}

impl TileSource {
    fn load(&mut self, key: TileKey) -> Result<Tile, TerrainError> {
        let tile = match self.load_flattened(key)? {
            Some(tile) => tile,
            None => self.load_geotiff(key)?,
        };
        if !tile.contains_rounded(key) {
            return Err(out_of_bounds(&tile, key).into());
        }
        Ok(tile)
    }

    fn load_flattened(&mut self, key: TileKey) -> Result<Option<Tile>, TerrainError> {
        let Some(dir) = &self.flatten_dir else {
            return Ok(None);
        };
        let path = dir.join(file_name(key, self.tile_size, FLATTENED_EXT));
        if !path.exists() {
            return Ok(None);
        }
        debug!("loading {path:?}");
        let tile = match self.mode {
            TileMode::InMem => Tile::load_flattened(&path),
            TileMode::MemMap => Tile::memmap_flattened(&path),
        };
        match tile {
            Ok(tile) => {
                self.stats.from_disk += 1;
                Ok(Some(tile))
            }
            Err(ElevationError::Io(e)) => Err(e.into()),
            Err(e) => {
                warn!("discarding unreadable {path:?}, {e}");
                fs::remove_file(&path)?;
                Ok(None)
            }
        }
    }

    fn load_geotiff(&mut self, key: TileKey) -> Result<Tile, TerrainError> {
        let path = self.resolver.resolve(key, self.tile_size, &mut self.stats)?;
        debug!("loading {path:?}");
        let tile = match self.mode {
            TileMode::InMem => Tile::load_geotiff(&path)?,
            TileMode::MemMap => Tile::memmap_geotiff(&path)?,
        };
        if let Some(dir) = &self.flatten_dir {
            let flat = dir.join(file_name(key, self.tile_size, FLATTENED_EXT));
            if let Err(e) = tile.write_flattened(&flat) {
                warn!("could not write {flat:?}, {e}");
            }
        }
        Ok(tile)
    }
}

fn out_of_bounds(tile: &Tile, Coord { x, y }: Coord<i32>) -> ElevationError {
    ElevationError::OutOfBounds {
        x: C::from(x),
        y: C::from(y),
        start: tile.start(),
        end: tile.end(),
    }
}

pub struct TileStoreBuilder {
    tile_size: Option<i32>,
    resolver: Option<Resolver>,
    capacity: usize,
    evict_batch: usize,
    mode: TileMode,
    flatten_dir: Option<PathBuf>,
}

impl TileStoreBuilder {
    /// Width and height of every tile, in raster cells.
    #[must_use]
    pub fn tile_size(mut self, cells: i32) -> Self {
        self.tile_size = Some(cells);
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Maximum number of tiles held in memory.
    #[must_use]
    pub fn capacity(mut self, tiles: usize) -> Self {
        self.capacity = tiles;
        self
    }

    /// Tiles dropped at once when the cache is full.
    #[must_use]
    pub fn evict_batch(mut self, tiles: usize) -> Self {
        self.evict_batch = tiles;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: TileMode) -> Self {
        self.mode = mode;
        self
    }

    /// Directory for flattened copies of decoded tiles.
    #[must_use]
    pub fn flatten_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.flatten_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<TileStore, TerrainError> {
        let tile_size = self
            .tile_size
            .filter(|size| *size > 0)
            .ok_or(TerrainError::Builder("tile_size"))?;
        let resolver = self.resolver.ok_or(TerrainError::Builder("resolver"))?;
        if self.capacity == 0 {
            return Err(TerrainError::Builder("capacity"));
        }
        if self.evict_batch == 0 {
            return Err(TerrainError::Builder("evict_batch"));
        }
        if let Some(dir) = &self.flatten_dir {
            fs::create_dir_all(dir)?;
        }

        let tiles = BoundedCache::new(self.capacity, self.evict_batch).with_on_remove(
            |key: &TileKey, tile: &mut Tile| {
                if tile.release() {
                    debug!("released tile {key:?}");
                }
            },
        );
        Ok(TileStore {
            tiles,
            source: TileSource {
                tile_size,
                resolver,
                mode: self.mode,
                flatten_dir: self.flatten_dir,
                stats: TileStats::default(),
            },
        })
    }
}

/// A [`TileStore`] shared between threads.
///
/// Every call holds the lock for its whole duration.
pub struct SharedTileStore {
    inner: Mutex<TileStore>,
}

impl SharedTileStore {
    pub fn new(store: TileStore) -> Self {
        Self {
            inner: Mutex::new(store),
        }
    }

    pub fn altitude_at(&self, x: C, y: C) -> Result<Elev, TerrainError> {
        self.lock().altitude_at(x, y)
    }

    pub fn fill_profile(
        &self,
        buf: &mut ProfileBuffer,
        a: Coord<C>,
        b: Coord<C>,
        max_step: C,
        with_heights: bool,
    ) -> Result<(), TerrainError> {
        self.lock().fill_profile(buf, a, b, max_step, with_heights)
    }

    pub fn fill_altitudes(
        &self,
        buf: &mut ProfileBuffer,
        upto: usize,
    ) -> Result<usize, TerrainError> {
        self.lock().fill_altitudes(buf, upto)
    }

    pub fn stats(&self) -> TileStats {
        self.lock().stats()
    }

    fn lock(&self) -> MutexGuard<'_, TileStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{tile_key, Resolver, SharedTileStore, TileKey, TileMode, TileStats, TileStore};
    use crate::{
        resolve::{tests::ScriptedClient, RemoteTiles, RetryPolicy},
        ProfileBuffer, TerrainError,
    };
    use approx::assert_relative_eq;
    use elevation::encode_geotiff;
    use geo::geometry::Coord;
    use std::{fs::File, path::Path, time::Duration};

    const SIZE: i32 = 10;

    /// Elevation of the synthetic terrain at a rounded coordinate.
    fn height(x: i32, y: i32) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let z = (x * 3 + y * 7) as f32;
        z
    }

    fn tile_samples(key: TileKey) -> Vec<f32> {
        let mut samples = Vec::new();
        for y in key.y..key.y + SIZE {
            for x in key.x..key.x + SIZE {
                samples.push(height(x, y));
            }
        }
        samples
    }

    fn write_tile(dir: &Path, key: TileKey) {
        let path = dir.join(super::file_name(key, SIZE, super::GEOTIFF_EXT));
        let out = File::create(path).unwrap();
        encode_geotiff(out, key, (10, 10), 4, &tile_samples(key)).unwrap();
    }

    fn local_store(dir: &Path, mode: TileMode) -> TileStore {
        for x in [-10, 0, 10] {
            for y in [-10, 0, 10] {
                write_tile(dir, Coord { x, y });
            }
        }
        TileStore::builder()
            .tile_size(SIZE)
            .resolver(Resolver::local(dir))
            .capacity(4)
            .mode(mode)
            .build()
            .unwrap()
    }

    #[test]
    fn test_tile_key() {
        assert_eq!(tile_key(Coord { x: 0, y: 9 }, 10), Coord { x: 0, y: 0 });
        assert_eq!(tile_key(Coord { x: 10, y: 19 }, 10), Coord { x: 10, y: 10 });
        assert_eq!(tile_key(Coord { x: -1, y: -10 }, 10), Coord { x: -10, y: -10 });
        assert_eq!(tile_key(Coord { x: -11, y: 0 }, 10), Coord { x: -20, y: 0 });
    }

    #[test]
    fn test_builder_requires_parameters() {
        assert!(matches!(
            TileStore::builder().resolver(Resolver::local(".")).build(),
            Err(TerrainError::Builder("tile_size"))
        ));
        assert!(matches!(
            TileStore::builder().tile_size(10).build(),
            Err(TerrainError::Builder("resolver"))
        ));
        assert!(matches!(
            TileStore::builder()
                .tile_size(10)
                .resolver(Resolver::local("."))
                .capacity(0)
                .build(),
            Err(TerrainError::Builder("capacity"))
        ));
    }

    #[test]
    fn test_altitude_at() {
        let dir = tempfile::tempdir().unwrap();
        for mode in [TileMode::InMem, TileMode::MemMap] {
            let mut store = local_store(dir.path(), mode);
            assert_eq!(store.altitude_at(3.2, 4.6).unwrap(), height(3, 5));
            assert_eq!(store.altitude_at(-0.6, 14.0).unwrap(), height(-1, 14));
            assert_eq!(store.altitude_at(19.49, -10.5).unwrap(), height(19, -10));
            assert!(matches!(
                store.altitude_at(25.0, 0.0),
                Err(TerrainError::Io(_))
            ));
        }
    }

    #[test]
    fn test_stitched_profile_matches_point_queries() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = local_store(dir.path(), TileMode::MemMap);
        let mut buf = ProfileBuffer::new();
        let (a, b) = (Coord { x: 2.0, y: 5.0 }, Coord { x: 17.0, y: 5.0 });
        store.fill_profile(&mut buf, a, b, 1.0, true).unwrap();

        assert_eq!(buf.len(), 16);
        // One load per tile crossed, and no lookups beyond that.
        assert_eq!(store.cache_stats().added, 2);
        assert_eq!(store.cache_stats().retrieved, 0);
        assert_eq!(store.stats().from_memory, 0);

        let last = buf[buf.len() - 1];
        assert_eq!((last.x, last.y), (b.x, b.y));
        assert_relative_eq!(last.m, 15.0);
        for pair in buf.windows(2) {
            assert!(pair[0].m < pair[1].m);
        }
        for sample in buf.iter() {
            let z = store.altitude_at(sample.x, sample.y).unwrap();
            assert_relative_eq!(sample.z, f64::from(z));
        }
    }

    #[test]
    fn test_step_is_a_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = local_store(dir.path(), TileMode::InMem);
        let mut buf = ProfileBuffer::new();
        let (a, b) = (Coord { x: 0.0, y: 0.0 }, Coord { x: 3.0, y: 4.0 });
        store.fill_profile(&mut buf, a, b, 2.0, false).unwrap();
        assert_eq!(buf.len(), 4);
        assert_relative_eq!(buf[1].m, 5.0 / 3.0);
        assert_eq!((buf[3].x, buf[3].y), (3.0, 4.0));
        assert!(buf.iter().all(|s| !s.is_resolved()));
        assert_eq!(store.cache_stats().added, 0);

        assert_eq!(store.fill_altitudes(&mut buf, 2).unwrap(), 2);
        assert!(buf[1].is_resolved());
        assert!(!buf[2].is_resolved());
        assert_eq!(store.fill_altitudes(&mut buf, 100).unwrap(), 2);
        assert!(buf.iter().all(|s| s.is_resolved()));
        assert_eq!(store.fill_altitudes(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_degenerate_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = local_store(dir.path(), TileMode::InMem);
        let mut buf = ProfileBuffer::new();
        let a = Coord { x: 1.0, y: 1.0 };
        for (b, step) in [(a, 1.0), (Coord { x: 2.0, y: 1.0 }, 0.0), (a, f64::NAN)] {
            assert!(matches!(
                store.fill_profile(&mut buf, a, b, step, true),
                Err(TerrainError::DegenerateGeometry(_))
            ));
        }
    }

    #[test]
    fn test_eviction_releases_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = local_store(dir.path(), TileMode::MemMap);
        for x in [-5.0, 5.0, 15.0] {
            for y in [-5.0, 5.0] {
                store.altitude_at(x, y).unwrap();
            }
        }
        assert_eq!(store.resident(), 4);
        assert_eq!(store.cache_stats().added, 6);
        assert_eq!(store.cache_stats().removed, 2);
        store.clear();
        assert_eq!(store.resident(), 0);
    }

    #[test]
    fn test_failed_load_keeps_cached_tiles() {
        let dir = tempfile::tempdir().unwrap();
        write_tile(dir.path(), Coord { x: 0, y: 0 });
        let mut store = TileStore::builder()
            .tile_size(SIZE)
            .resolver(Resolver::local(dir.path()))
            .capacity(1)
            .build()
            .unwrap();
        assert_eq!(store.altitude_at(1.0, 2.0).unwrap(), height(1, 2));
        // Nothing on disk for (50, 0).
        assert!(store.altitude_at(55.0, 3.0).is_err());
        assert_eq!(store.resident(), 1);
        assert_eq!(store.cache_stats().removed, 0);
        assert_eq!(store.cache_stats().eviction_passes, 0);
        assert_eq!(store.altitude_at(1.0, 2.0).unwrap(), height(1, 2));
        assert_eq!(store.stats().from_memory, 1);
    }

    #[test]
    fn test_unwritable_flatten_dir_still_loads() {
        let tif_dir = tempfile::tempdir().unwrap();
        let flt_parent = tempfile::tempdir().unwrap();
        let flt_dir = flt_parent.path().join("flat");
        write_tile(tif_dir.path(), Coord { x: 0, y: 0 });
        let mut store = TileStore::builder()
            .tile_size(SIZE)
            .resolver(Resolver::local(tif_dir.path()))
            .flatten_dir(&flt_dir)
            .build()
            .unwrap();
        // Replace the directory with a plain file so writes into it fail.
        std::fs::remove_dir(&flt_dir).unwrap();
        std::fs::write(&flt_dir, b"").unwrap();
        assert_eq!(store.altitude_at(4.0, 7.0).unwrap(), height(4, 7));
        assert_eq!(store.resident(), 1);
    }

    #[test]
    fn test_shared_profile() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedTileStore::new(local_store(dir.path(), TileMode::InMem));
        let (a, b) = (Coord { x: -5.0, y: 2.0 }, Coord { x: 5.0, y: 2.0 });
        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    let mut buf = ProfileBuffer::new();
                    shared.fill_profile(&mut buf, a, b, 1.0, false).unwrap();
                    assert_eq!(buf.len(), 11);
                    assert_eq!(shared.fill_altitudes(&mut buf, 6).unwrap(), 6);
                    assert_eq!(buf[0].z, f64::from(height(-5, 2)));
                    assert!(!buf[6].is_resolved());
                });
            }
        });
        assert_eq!(shared.stats().from_disk, 2);
    }

    #[test]
    fn test_flattened_copies_are_reused() {
        let tif_dir = tempfile::tempdir().unwrap();
        let flt_dir = tempfile::tempdir().unwrap();
        let key = Coord { x: 0, y: 0 };
        write_tile(tif_dir.path(), key);

        let build = || {
            TileStore::builder()
                .tile_size(SIZE)
                .resolver(Resolver::local(tif_dir.path()))
                .flatten_dir(flt_dir.path())
                .mode(TileMode::MemMap)
                .build()
                .unwrap()
        };
        let mut store = build();
        assert_eq!(store.altitude_at(4.0, 4.0).unwrap(), height(4, 4));
        assert!(flt_dir.path().join("0_0_10.flt").exists());

        std::fs::remove_file(tif_dir.path().join("0_0_10.tif")).unwrap();
        let mut store = build();
        assert_eq!(store.altitude_at(9.0, 0.0).unwrap(), height(9, 0));
        assert_eq!(store.stats().from_disk, 1);
    }

    #[test]
    fn test_remote_tiles_are_downloaded_once() {
        let dir = tempfile::tempdir().unwrap();
        let key = Coord { x: 10, y: 0 };
        let mut body = Vec::new();
        encode_geotiff(&mut body, key, (10, 10), 4, &tile_samples(key)).unwrap();
        let client = ScriptedClient::default();
        client.push_body(crate::resolve::tests::QUOTA);
        client.push_body(&body);

        let remote = RemoteTiles::new(dir.path(), "wms?bbox={bbox}", Box::new(client.clone()))
            .unwrap()
            .retry(RetryPolicy {
                attempts: 2,
                delay: Duration::ZERO,
            });
        let store = TileStore::builder()
            .tile_size(SIZE)
            .resolver(Resolver::Remote(remote))
            .build()
            .unwrap();
        let shared = SharedTileStore::new(store);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    assert_eq!(shared.altitude_at(12.0, 3.0).unwrap(), height(12, 3));
                });
            }
        });
        assert_eq!(client.request_count(), 2);
        assert_eq!(
            shared.stats(),
            TileStats {
                from_memory: 3,
                downloaded: 1,
                quota_failures: 1,
                ..TileStats::default()
            }
        );
    }
}
