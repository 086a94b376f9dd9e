//! Tile cache over any [`RangeQuery`] implementation.
//!
//! The genome is cut into fixed-width tiles per chromosome. A query is
//! answered from the tiles it touches; each missing tile is fetched from the
//! wrapped source exactly once, even when several threads ask for it at the
//! same time, and then kept in a bounded LRU table.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tracing::debug;

use crate::{BbiError, RangeQuery, Record, Result};

/// Sizing of a [`TileCache`].
///
/// # Examples
///
/// ```rust
/// use bbix::TileCacheConfig;
///
/// let config = TileCacheConfig::default();
/// assert_eq!(config.max_tiles, 1000);
/// assert_eq!(config.tile_size, 100_000);
///
/// assert!(TileCacheConfig::new(0, 100).validate().is_err());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TileCacheConfig {
    /// Maximum number of tiles held at once
    pub max_tiles: usize,

    /// Width of a tile in bases
    pub tile_size: u32,
}
impl TileCacheConfig {
    pub fn new(max_tiles: usize, tile_size: u32) -> Self {
        Self {
            max_tiles,
            tile_size,
        }
    }

    /// Checks that both limits are non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_tiles == 0 {
            return Err(BbiError::InvalidConfig(
                "max_tiles must be at least 1".to_string(),
            ));
        }
        if self.tile_size == 0 {
            return Err(BbiError::InvalidConfig(
                "tile_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
impl Default for TileCacheConfig {
    fn default() -> Self {
        Self::new(1000, 100_000)
    }
}

/// Counters describing how a [`TileCache`] has been used.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    /// Tile requests answered without fetching
    pub hits: u64,
    /// Tile fetches started
    pub misses: u64,
    /// Tiles dropped to make room
    pub evictions: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TileKey {
    chrom: String,
    index: u32,
}

/// Records held by one tile.
#[derive(Debug, Default)]
struct Tile {
    /// Records starting before the tile that reach into it
    spill: Vec<Record>,
    /// Records starting inside the tile
    owned: Vec<Record>,
}
impl Tile {
    /// Clones the records of this tile that belong to a query over
    /// `[start, end)`. Spill-over records are only reported by the first tile
    /// a query touches, so no record is returned twice.
    fn overlapping(&self, first: bool, start: u32, end: u32) -> Vec<Record> {
        let spill = if first { self.spill.as_slice() } else { &[] };
        spill
            .iter()
            .chain(&self.owned)
            .filter(|record| record.overlaps(start, end))
            .cloned()
            .collect()
    }
}

enum FetchState {
    Running,
    Done(Arc<Tile>),
    Failed,
}

/// A fetch in progress, shared by the fetching thread and its waiters.
struct Pending {
    state: Mutex<FetchState>,
    done: Condvar,
}
impl Pending {
    fn new() -> Self {
        Self {
            state: Mutex::new(FetchState::Running),
            done: Condvar::new(),
        }
    }

    fn finish(&self, state: FetchState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.done.notify_all();
    }

    /// Blocks until the fetch ends; `None` means it failed.
    fn wait(&self) -> Option<Arc<Tile>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                FetchState::Running => {
                    state = self
                        .done
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner)
                }
                FetchState::Done(tile) => return Some(Arc::clone(tile)),
                FetchState::Failed => return None,
            }
        }
    }
}

/// Completed tiles and in-flight fetches, guarded together so that checking
/// for a tile and registering a fetch for it is one atomic step.
struct TileTable {
    lru: LruCache<TileKey, Arc<Tile>>,
    pending: HashMap<TileKey, Arc<Pending>>,
    stats: CacheStats,
}

impl TileTable {
    fn store(&mut self, key: TileKey, tile: Arc<Tile>) {
        if let Some((evicted, _)) = self.lru.push(key.clone(), tile) {
            if evicted != key {
                self.stats.evictions += 1;
                debug!(chrom = %evicted.chrom, tile = evicted.index, "evicted tile");
            }
        }
    }
}

/// Completes a registered fetch when dropped: the pending entry is removed,
/// a fetched tile is stored, and waiters are woken. Dropping without a tile
/// (fetch error or panic) wakes waiters with a failure so they retry.
struct InFlight<'a> {
    table: &'a Mutex<TileTable>,
    key: &'a TileKey,
    pending: &'a Pending,
    tile: Option<Arc<Tile>>,
}
impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.pending.remove(self.key);
            if let Some(tile) = &self.tile {
                table.store(self.key.clone(), Arc::clone(tile));
            }
        }
        self.pending.finish(match self.tile.take() {
            Some(tile) => FetchState::Done(tile),
            None => FetchState::Failed,
        });
    }
}

enum Lookup {
    Hit(Arc<Tile>),
    Wait(Arc<Pending>),
    Fetch(Arc<Pending>),
}

/// Bounded, thread-safe tile cache in front of a [`RangeQuery`] source.
///
/// `TileCache` is itself a [`RangeQuery`] and returns exactly the records the
/// wrapped source would. Failed fetches are never cached.
///
/// # Examples
///
/// ```rust,no_run
/// use bbix::{BbiReader, RangeQuery, TileCache, TileCacheConfig};
///
/// # fn main() -> bbix::Result<()> {
/// let reader = BbiReader::from_path("methylation.bb")?;
/// let cache = TileCache::new(reader, TileCacheConfig::new(64, 10_000))?;
///
/// // the first query fetches tiles 1000 and 1001; the second reuses them
/// let cold: Vec<_> = cache.query("chr11", 10_001_000, 10_012_000)?.collect::<Result<_, _>>()?;
/// let warm: Vec<_> = cache.query("chr11", 10_001_000, 10_012_000)?.collect::<Result<_, _>>()?;
/// assert_eq!(cold, warm);
/// assert_eq!(cache.stats().misses, 2);
/// # Ok(())
/// # }
/// ```
pub struct TileCache<Q> {
    inner: Q,
    config: TileCacheConfig,
    table: Mutex<TileTable>,
}
impl<Q: RangeQuery> TileCache<Q> {
    /// Wraps `inner` with a cache sized by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BbiError::InvalidConfig`] when either limit is zero.
    pub fn new(inner: Q, config: TileCacheConfig) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_tiles)
            .ok_or_else(|| BbiError::InvalidConfig("max_tiles must be at least 1".to_string()))?;
        Ok(Self {
            inner,
            config,
            table: Mutex::new(TileTable {
                lru: LruCache::new(capacity),
                pending: HashMap::new(),
                stats: CacheStats::default(),
            }),
        })
    }

    pub fn config(&self) -> &TileCacheConfig {
        &self.config
    }

    /// The wrapped source.
    pub fn inner(&self) -> &Q {
        &self.inner
    }

    pub fn into_inner(self) -> Q {
        self.inner
    }

    fn table(&self) -> MutexGuard<'_, TileTable> {
        // tiles are immutable once stored, so a poisoned table is still valid
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of tiles currently held.
    pub fn len(&self) -> usize {
        self.table().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every stored tile. Fetches in flight still complete.
    pub fn clear(&self) {
        self.table().lru.clear();
    }

    /// Whether tile `index` of `chrom` is stored, without touching its
    /// recency.
    pub fn contains(&self, chrom: &str, index: u32) -> bool {
        self.table().lru.contains(&TileKey {
            chrom: chrom.to_owned(),
            index,
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.table().stats
    }

    /// Index of the tile containing `position`.
    pub fn tile_index(&self, position: u32) -> u32 {
        position / self.config.tile_size
    }

    /// Half-open base range covered by tile `index`.
    fn tile_bounds(&self, index: u32) -> (u32, u32) {
        let size = u64::from(self.config.tile_size);
        let start = u64::from(index) * size;
        let end = (start + size).min(u64::from(u32::MAX));
        (start as u32, end as u32)
    }

    /// Tiles touched by a query over `[start, end)`.
    fn tiles(&self, start: u32, end: u32) -> Range<u32> {
        if start >= end {
            return 0..0;
        }
        self.tile_index(start)..self.tile_index(end - 1) + 1
    }

    /// Returns tile `index` of `chrom`, fetching it if needed.
    fn tile(&self, chrom: &str, index: u32) -> Result<Arc<Tile>> {
        let key = TileKey {
            chrom: chrom.to_owned(),
            index,
        };
        loop {
            let lookup = {
                let mut table = self.table();
                if let Some(tile) = table.lru.get(&key).cloned() {
                    table.stats.hits += 1;
                    Lookup::Hit(tile)
                } else if let Some(pending) = table.pending.get(&key).cloned() {
                    table.stats.hits += 1;
                    Lookup::Wait(pending)
                } else {
                    let pending = Arc::new(Pending::new());
                    table.pending.insert(key.clone(), Arc::clone(&pending));
                    table.stats.misses += 1;
                    Lookup::Fetch(pending)
                }
            };

            match lookup {
                Lookup::Hit(tile) => return Ok(tile),
                Lookup::Wait(pending) => match pending.wait() {
                    Some(tile) => return Ok(tile),
                    None => debug!(chrom, tile = index, "awaited fetch failed; retrying"),
                },
                Lookup::Fetch(pending) => {
                    let mut in_flight = InFlight {
                        table: &self.table,
                        key: &key,
                        pending: &pending,
                        tile: None,
                    };
                    let fetched = self.fetch(chrom, index);
                    if let Ok(tile) = &fetched {
                        in_flight.tile = Some(Arc::clone(tile));
                    }
                    drop(in_flight);
                    return fetched;
                }
            }
        }
    }

    /// Runs the wrapped query for one tile. Called without the table lock.
    ///
    /// The window reaches one base before the tile so that zero-length
    /// records sitting exactly on the tile's start are included.
    fn fetch(&self, chrom: &str, index: u32) -> Result<Arc<Tile>> {
        let (start, end) = self.tile_bounds(index);
        let wrap = |source: BbiError| BbiError::TileFetch {
            chrom: chrom.to_owned(),
            tile: u64::from(index),
            source: Box::new(source),
        };

        let mut tile = Tile::default();
        let window = self.inner.query(chrom, start.saturating_sub(1), end);
        for record in window.map_err(wrap)? {
            let record = record.map_err(wrap)?;
            if record.start >= start {
                tile.owned.push(record);
            } else {
                tile.spill.push(record);
            }
        }
        debug!(
            chrom,
            tile = index,
            owned = tile.owned.len(),
            spill = tile.spill.len(),
            "fetched tile"
        );
        Ok(Arc::new(tile))
    }
}

impl<Q> fmt::Debug for TileCache<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TileCache")
            .field("config", &self.config)
            .field("tiles", &table.lru.len())
            .field("stats", &table.stats)
            .finish_non_exhaustive()
    }
}

impl<Q: RangeQuery> RangeQuery for TileCache<Q> {
    type Records<'a> = TileRecords<'a, Q> where Self: 'a;

    fn query(&self, chrom: &str, start: u32, end: u32) -> Result<Self::Records<'_>> {
        if start > end {
            return Err(BbiError::InvalidRange { start, end });
        }
        let tiles = self.tiles(start, end);
        Ok(TileRecords {
            cache: self,
            chrom: chrom.to_owned(),
            start,
            end,
            first_tile: tiles.start,
            tiles,
            current: Vec::new().into_iter(),
        })
    }
}

/// Iterator over a cached query, fetching tiles as it reaches them.
///
/// A tile that cannot be fetched is reported once as
/// [`BbiError::TileFetch`]; iteration then continues with the next tile.
pub struct TileRecords<'a, Q: RangeQuery> {
    cache: &'a TileCache<Q>,
    chrom: String,
    start: u32,
    end: u32,
    first_tile: u32,
    tiles: Range<u32>,
    current: std::vec::IntoIter<Record>,
}
impl<Q: RangeQuery> Iterator for TileRecords<'_, Q> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            let index = self.tiles.next()?;
            match self.cache.tile(&self.chrom, index) {
                Ok(tile) => {
                    self.current = tile
                        .overlapping(index == self.first_tile, self.start, self.end)
                        .into_iter()
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
