//! Lock-free prediction cache memoising evaluator output.
//!
//! Set-associative over (table, chunk, 8 entries). There are no locks
//! anywhere: readers and writers race freely, Stockfish-style, and torn or
//! colliding entries are rejected on read by summing the stored priors —
//! a full policy always sums to one, so a splice or a type-1 collision
//! almost never does. Rejected entries keep their stale age and fall to
//! the next eviction.
//!
//! Priors are quantised to `u16` with a floor of one quantum, so a stored
//! policy can never contain a hard zero; a "guard" quantum of 1.0 sits
//! just past the last legal move to catch reads with a shorter move count.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::info;

/// Positions with more legal moves than this don't fit an entry and are
/// neither probed nor stored.
pub const MAX_CACHE_MOVES: usize = 56;

const ENTRY_COUNT: usize = 8;
const MAX_TABLE_COUNT: usize = 1 << 8;
const MAX_CHUNKS_PER_TABLE: usize = 1 << 20;
const CHUNK_BYTES: usize = 1 << 10;
const GIB: usize = 1 << 30;

/// Largest tolerated drift, in quanta, between a stored policy's sum and
/// Q(1.0). Covers worst-case quantisation rounding for any legal move
/// count up to `MAX_CACHE_MOVES` (~84 quanta) with headroom.
const PRIOR_SUM_ALLOWANCE: i32 = 120;

const QUANTIZED_ONE: u16 = u16::MAX;

/// Quantise a probability to `[1, 65535]`. Never returns zero, preserving
/// the guard-quantum invariant.
#[inline]
pub fn quantize_probability(probability: f32) -> u16 {
    let scaled = (probability.clamp(0.0, 1.0) * 65534.0).round() as u32 + 1;
    scaled.min(QUANTIZED_ONE as u32) as u16
}

/// Inverse of `quantize_probability`, exact at both ends.
#[inline]
pub fn dequantize_probability(quantized: u16) -> f32 {
    (quantized.max(1) - 1) as f32 / 65534.0
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("prediction cache size must be a power-of-two GiB of at most 256, got {0} GiB")]
    InvalidSize(usize),

    #[error("could not allocate a prediction cache of at least {min_gib} GiB")]
    AllocationFailed { min_gib: usize },
}

// ============================================================================
// Entry and chunk
// ============================================================================

/// One cached evaluation: 128 bytes, cache-line aligned.
///
/// Fields are `UnsafeCell` because entries are read and written racily
/// across threads with no synchronisation at all; every access goes
/// through volatile loads/stores and correctness rests on the prior-sum
/// check, not on ordering.
#[repr(C, align(128))]
struct PredictionCacheEntry {
    key: UnsafeCell<u64>,
    value: UnsafeCell<f32>,
    age: UnsafeCell<i32>,
    priors: UnsafeCell<[u16; MAX_CACHE_MOVES]>,
}

impl PredictionCacheEntry {
    #[inline]
    fn read_key(&self) -> u64 {
        unsafe { ptr::read_volatile(self.key.get()) }
    }

    #[inline]
    fn read_age(&self) -> i32 {
        unsafe { ptr::read_volatile(self.age.get()) }
    }

    #[inline]
    fn bump_age(&self) {
        unsafe {
            let age = self.age.get();
            ptr::write_volatile(age, ptr::read_volatile(age).wrapping_add(1));
        }
    }

    #[inline]
    fn read_prior(&self, index: usize) -> u16 {
        debug_assert!(index < MAX_CACHE_MOVES);
        unsafe { ptr::read_volatile((self.priors.get() as *const u16).add(index)) }
    }

    #[inline]
    fn write_prior(&self, index: usize, quantized: u16) {
        debug_assert!(index < MAX_CACHE_MOVES);
        unsafe { ptr::write_volatile((self.priors.get() as *mut u16).add(index), quantized) }
    }

    fn clear(&self) {
        unsafe {
            ptr::write_volatile(self.key.get(), 0);
            ptr::write_volatile(self.age.get(), 0);
        }
    }
}

/// Eight entries sharing an address: 1024 bytes, aligned so a chunk never
/// straddles more cache lines than it has to.
#[repr(C, align(1024))]
pub struct PredictionCacheChunk {
    entries: [PredictionCacheEntry; ENTRY_COUNT],
}

// Racy by design; see the entry type.
unsafe impl Sync for PredictionCacheChunk {}
unsafe impl Send for PredictionCacheChunk {}

/// What a `put` displaced, for the cache's occupancy metrics.
enum PutOutcome {
    FreshSlot,
    ReplacedSlot,
}

impl PredictionCacheChunk {
    fn clear(&self) {
        for entry in &self.entries {
            entry.clear();
        }
    }

    /// Probe this chunk. On a hit, dequantised priors for the first
    /// `move_count` moves are written to `priors_out` and the value is
    /// returned. `priors_out` may be clobbered even on a miss.
    fn try_get(&self, key: u64, move_count: usize, priors_out: &mut [f32]) -> Option<f32> {
        // Everything ages on every probe, so untouched entries drift
        // toward eviction.
        for entry in &self.entries {
            entry.bump_age();
        }

        for entry in &self.entries {
            if entry.read_key() != key {
                continue;
            }

            let mut prior_sum = 0i32;
            for m in 0..move_count {
                let quantized = entry.read_prior(m);
                prior_sum += quantized as i32;
                priors_out[m] = dequantize_probability(quantized);
            }

            // Rejects type-1 collisions and spliced writes. Crucially the
            // age is not freshened on rejection, so a spliced entry gets
            // evicted instead of lingering.
            let expected = QUANTIZED_ONE as i32;
            if (prior_sum - expected).abs() > PRIOR_SUM_ALLOWANCE {
                return None;
            }

            unsafe {
                ptr::write_volatile(entry.age.get(), i32::MIN);
            }
            return Some(unsafe { ptr::read_volatile(entry.value.get()) });
        }

        None
    }

    fn put(&self, key: u64, value: f32, move_count: usize, priors: &[f32]) -> PutOutcome {
        // Replace the same key if present so probes see the new data;
        // otherwise the oldest entry.
        let mut replace = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.read_key() == key {
                replace = i;
                break;
            }
            if entry.read_age() > self.entries[replace].read_age() {
                replace = i;
            }
        }
        let entry = &self.entries[replace];
        let outcome = if entry.read_key() != 0 {
            PutOutcome::ReplacedSlot
        } else {
            PutOutcome::FreshSlot
        };

        unsafe {
            ptr::write_volatile(entry.key.get(), key);
            ptr::write_volatile(entry.value.get(), value);
            ptr::write_volatile(entry.age.get(), i32::MIN);
        }
        for m in 0..move_count {
            entry.write_prior(m, quantize_probability(priors[m]));
        }
        // Guard quantum: a probe with a different move count must see a sum
        // far from Q(1.0), not a run of plausible trailing values.
        if move_count < MAX_CACHE_MOVES {
            entry.write_prior(move_count, QUANTIZED_ONE);
        }

        outcome
    }

    #[cfg(test)]
    fn zero_prior_for_testing(&self, key: u64, index: usize) {
        for entry in &self.entries {
            if entry.read_key() == key {
                entry.write_prior(index, 0);
            }
        }
    }
}

// ============================================================================
// Table storage
// ============================================================================

/// One contiguous, zero-initialised run of chunks.
struct Table {
    chunks: *mut PredictionCacheChunk,
    chunk_count: usize,
}

unsafe impl Send for Table {}
unsafe impl Sync for Table {}

impl Table {
    fn allocate(chunk_count: usize) -> Option<Table> {
        let layout = Layout::from_size_align(chunk_count * CHUNK_BYTES, CHUNK_BYTES).ok()?;
        // Zeroed memory is a valid, empty chunk array.
        let chunks = unsafe { alloc_zeroed(layout) } as *mut PredictionCacheChunk;
        if chunks.is_null() {
            return None;
        }
        Some(Table {
            chunks,
            chunk_count,
        })
    }

    #[inline]
    fn chunk(&self, index: usize) -> &PredictionCacheChunk {
        debug_assert!(index < self.chunk_count);
        unsafe { &*self.chunks.add(index) }
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.chunk_count * CHUNK_BYTES, CHUNK_BYTES).expect("layout");
        unsafe { dealloc(self.chunks as *mut u8, layout) };
    }
}

// ============================================================================
// The cache
// ============================================================================

/// Result of a cache probe. A miss carries the chunk the caller should
/// `put` into once the evaluation arrives, when storing is appropriate.
pub enum CacheProbe<'a> {
    Hit { value: f32 },
    Miss { store: Option<&'a PredictionCacheChunk> },
}

/// Fixed-capacity shared cache of evaluator predictions, keyed by position
/// fingerprint.
pub struct PredictionCache {
    tables: Vec<Table>,
    chunks_per_table: usize,
    allocated_request_gib: usize,
    allocated_min_gib: usize,

    hit_count: AtomicU64,
    eviction_count: AtomicU64,
    probe_count: AtomicU64,
    entry_count: AtomicU64,
    entry_capacity: u64,
}

impl PredictionCache {
    pub fn new() -> Self {
        PredictionCache {
            tables: Vec::new(),
            chunks_per_table: 0,
            allocated_request_gib: 0,
            allocated_min_gib: 0,
            hit_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
            probe_count: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            entry_capacity: 0,
        }
    }

    /// Reserve `request_gib` of cache, walking the request down to
    /// `min_gib` when memory is tight or fragmented. Sizes are GiB powers
    /// of two (or zero to disable); tables are tried from 1 GiB down to
    /// 4 MiB each before the request shrinks.
    pub fn allocate(&mut self, request_gib: usize, min_gib: usize) -> Result<(), CacheError> {
        let request_gib = request_gib.max(min_gib);
        for size in [request_gib, min_gib] {
            if size > MAX_TABLE_COUNT || (size & size.wrapping_sub(1)) != 0 && size != 0 {
                return Err(CacheError::InvalidSize(size));
            }
        }

        if request_gib == self.allocated_request_gib && min_gib == self.allocated_min_gib {
            return Ok(());
        }
        self.free();

        if request_gib == 0 {
            return Ok(());
        }

        let mut size_gib = request_gib;
        let mut chunks_per_table = MAX_CHUNKS_PER_TABLE;
        loop {
            let table_bytes = chunks_per_table * CHUNK_BYTES;
            let table_count = size_gib * (GIB / table_bytes);

            if table_count > MAX_TABLE_COUNT {
                // Walked the table size down to the limit at this request;
                // halve the request or give up.
                if size_gib > min_gib {
                    size_gib >>= 1;
                    chunks_per_table = MAX_CHUNKS_PER_TABLE;
                    continue;
                }
                return Err(CacheError::AllocationFailed { min_gib });
            }

            if self.try_allocate(table_count, chunks_per_table) {
                self.allocated_request_gib = request_gib;
                self.allocated_min_gib = min_gib;
                info!(
                    size_gib,
                    tables = table_count,
                    request_gib,
                    min_gib,
                    "allocated prediction cache"
                );
                return Ok(());
            }

            chunks_per_table >>= 1;
        }
    }

    fn try_allocate(&mut self, table_count: usize, chunks_per_table: usize) -> bool {
        debug_assert!(table_count <= MAX_TABLE_COUNT);
        debug_assert!(chunks_per_table <= MAX_CHUNKS_PER_TABLE);

        let mut tables = Vec::with_capacity(table_count);
        for _ in 0..table_count {
            match Table::allocate(chunks_per_table) {
                Some(table) => tables.push(table),
                // Partial allocations unwind via Drop.
                None => return false,
            }
        }

        self.tables = tables;
        self.chunks_per_table = chunks_per_table;
        self.entry_capacity = (table_count * chunks_per_table * ENTRY_COUNT) as u64;
        true
    }

    pub fn free(&mut self) {
        self.tables.clear();
        self.chunks_per_table = 0;
        self.allocated_request_gib = 0;
        self.allocated_min_gib = 0;
        self.entry_capacity = 0;
        self.entry_count.store(0, Ordering::Relaxed);
        self.reset_probe_metrics();
    }

    #[inline]
    fn chunk_for(&self, key: u64) -> &PredictionCacheChunk {
        // Zobrist keys spread entropy evenly, and both modulos are powers
        // of two, so xor-folding combines bits without bias.

        // Up to 16 high bits choose the table, folded to 8.
        let table_key = (key >> 48) as u16;
        let table_fold = ((table_key & 0xFF) ^ (table_key >> 8)) as usize;
        let table = &self.tables[table_fold % self.tables.len()];

        // Up to 48 low bits choose the chunk, folding the lowest 40 down
        // to 20; bits dangling above don't hurt.
        let chunk_key = key & 0xFFFF_FFFF_FFFF;
        let chunk_fold = ((chunk_key & 0xFFFFF) ^ (chunk_key >> 20)) as usize;
        table.chunk(chunk_fold % self.chunks_per_table)
    }

    /// Probe for a cached prediction. Never blocks, never allocates.
    ///
    /// On a hit, `priors_out[..move_count]` holds the dequantised policy.
    /// On a miss, `priors_out` may be clobbered, and the returned chunk (if
    /// any) is where the caller should store the prediction.
    pub fn try_get(&self, key: u64, move_count: usize, priors_out: &mut [f32]) -> CacheProbe<'_> {
        if self.tables.is_empty() || move_count > MAX_CACHE_MOVES {
            return CacheProbe::Miss { store: None };
        }

        self.probe_count.fetch_add(1, Ordering::Relaxed);
        let chunk = self.chunk_for(key);

        match chunk.try_get(key, move_count, priors_out) {
            Some(value) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                CacheProbe::Hit { value }
            }
            None => CacheProbe::Miss { store: Some(chunk) },
        }
    }

    /// Store a prediction into the chunk returned by a previous miss.
    pub fn put(
        &self,
        chunk: &PredictionCacheChunk,
        key: u64,
        value: f32,
        move_count: usize,
        priors: &[f32],
    ) {
        debug_assert!(move_count <= MAX_CACHE_MOVES);
        match chunk.put(key, value, move_count, priors) {
            PutOutcome::FreshSlot => {
                self.entry_count.fetch_add(1, Ordering::Relaxed);
            }
            PutOutcome::ReplacedSlot => {
                self.eviction_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop every entry, keeping the allocation.
    pub fn clear(&self) {
        for table in &self.tables {
            for i in 0..table.chunk_count {
                table.chunk(i).clear();
            }
        }
        self.entry_count.store(0, Ordering::Relaxed);
        self.reset_probe_metrics();
    }

    pub fn reset_probe_metrics(&self) {
        self.hit_count.store(0, Ordering::Relaxed);
        self.eviction_count.store(0, Ordering::Relaxed);
        self.probe_count.store(0, Ordering::Relaxed);
    }

    pub fn permille_full(&self) -> u32 {
        if self.entry_capacity == 0 {
            return 0;
        }
        (self.entry_count.load(Ordering::Relaxed) * 1000 / self.entry_capacity) as u32
    }

    pub fn permille_hits(&self) -> u32 {
        let probes = self.probe_count.load(Ordering::Relaxed);
        if probes == 0 {
            return 0;
        }
        (self.hit_count.load(Ordering::Relaxed) * 1000 / probes) as u32
    }

    pub fn permille_evictions(&self) -> u32 {
        let probes = self.probe_count.load(Ordering::Relaxed);
        if probes == 0 {
            return 0;
        }
        (self.eviction_count.load(Ordering::Relaxed) * 1000 / probes) as u32
    }

    pub fn is_allocated(&self) -> bool {
        !self.tables.is_empty()
    }
}

impl Default for PredictionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PredictionCache {
    fn drop(&mut self) {
        self.free();
    }
}
