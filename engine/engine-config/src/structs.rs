//! Configuration struct definitions.
//!
//! All config structs with serde deserialization support and default values.
//! Missing sections or fields fall back to the `defaults` module through the
//! container-level `#[serde(default)]`.

use crate::defaults;
use serde::Deserialize;

/// Root configuration structure matching config.toml
#[derive(Debug, Deserialize, Default, Clone)]
pub struct CentralConfig {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub self_play: SelfPlayConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tree-search tuning: PUCT constants, first-play urgency, selective
/// backpropagation, elimination, endgame handling.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub pb_c_base: f64,
    pub pb_c_init: f64,
    pub fpu_default: f64,
    pub fpu_root: f64,
    pub virtual_loss_coefficient: f64,
    /// AZ-PUCT distance from the maximum inside which a selected child
    /// still backpropagates its value.
    pub backpropagation_threshold: f64,
    pub elimination_base_exponent: u32,
    pub linear_exploration_rate: f64,
    pub linear_exploration_delay: f64,
    pub moving_average_build: f64,
    pub moving_average_cap: u32,
    pub endgame_decay_divisor: f64,
    /// Self-play probes the prediction cache only this close to the root.
    pub max_cache_ply: u32,
    pub move_diversity_enabled: bool,
    pub move_diversity_plies: u32,
    pub move_diversity_temperature: f64,
    pub move_diversity_value_delta: f64,
    /// Non-pawn material (pawn units) at or below which move selection
    /// switches to the post-hoc minimax.
    pub minimax_material_threshold: u32,
    pub minimax_visits_recurse: i32,
    pub minimax_visits_ignore: f64,
    /// Seconds of search after which a proven mate stops the search.
    pub mate_stop_seconds: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            pb_c_base: defaults::PB_C_BASE,
            pb_c_init: defaults::PB_C_INIT,
            fpu_default: defaults::FPU_DEFAULT,
            fpu_root: defaults::FPU_ROOT,
            virtual_loss_coefficient: defaults::VIRTUAL_LOSS_COEFFICIENT,
            backpropagation_threshold: defaults::BACKPROPAGATION_THRESHOLD,
            elimination_base_exponent: defaults::ELIMINATION_BASE_EXPONENT,
            linear_exploration_rate: defaults::LINEAR_EXPLORATION_RATE,
            linear_exploration_delay: defaults::LINEAR_EXPLORATION_DELAY,
            moving_average_build: defaults::MOVING_AVERAGE_BUILD,
            moving_average_cap: defaults::MOVING_AVERAGE_CAP,
            endgame_decay_divisor: defaults::ENDGAME_DECAY_DIVISOR,
            max_cache_ply: defaults::MAX_CACHE_PLY,
            move_diversity_enabled: defaults::MOVE_DIVERSITY_ENABLED,
            move_diversity_plies: defaults::MOVE_DIVERSITY_PLIES,
            move_diversity_temperature: defaults::MOVE_DIVERSITY_TEMPERATURE,
            move_diversity_value_delta: defaults::MOVE_DIVERSITY_VALUE_DELTA,
            minimax_material_threshold: defaults::MINIMAX_MATERIAL_THRESHOLD,
            minimax_visits_recurse: defaults::MINIMAX_VISITS_RECURSE,
            minimax_visits_ignore: defaults::MINIMAX_VISITS_IGNORE,
            mate_stop_seconds: defaults::MATE_STOP_SECONDS,
        }
    }
}

/// Self-play episode configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SelfPlayConfig {
    pub simulations_per_move: u32,
    pub num_sampling_moves: u32,
    pub dirichlet_alpha: f64,
    pub exploration_fraction: f64,
}

impl Default for SelfPlayConfig {
    fn default() -> Self {
        Self {
            simulations_per_move: defaults::SIMULATIONS_PER_MOVE,
            num_sampling_moves: defaults::NUM_SAMPLING_MOVES,
            dirichlet_alpha: defaults::DIRICHLET_ALPHA,
            exploration_fraction: defaults::EXPLORATION_FRACTION,
        }
    }
}

/// Prediction cache sizing.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Requested size in GiB; must be a power of two.
    pub request_gib: usize,
    /// Smallest acceptable size in GiB when memory is tight.
    pub min_gib: usize,
    /// Minimum seconds between cache flushes triggered by network updates.
    pub network_flush_throttle_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            request_gib: defaults::CACHE_REQUEST_GIB,
            min_gib: defaults::CACHE_MIN_GIB,
            network_flush_throttle_secs: defaults::NETWORK_FLUSH_THROTTLE_SECS,
        }
    }
}

/// Worker pool shape.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkersConfig {
    pub thread_count: usize,
    /// Concurrent simulations (batch slots) per worker thread.
    pub parallelism: usize,
    /// Root visits below which the slow start applies.
    pub slowstart_nodes: i32,
    pub slowstart_threads: usize,
    pub slowstart_parallelism: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            thread_count: defaults::WORKER_THREAD_COUNT,
            parallelism: defaults::WORKER_PARALLELISM,
            slowstart_nodes: defaults::SLOWSTART_NODES,
            slowstart_threads: defaults::SLOWSTART_THREADS,
            slowstart_parallelism: defaults::SLOWSTART_PARALLELISM,
        }
    }
}

/// Game-clock management.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimeConfig {
    pub safety_buffer_ms: u64,
    /// Allocate `remaining / fraction_of_remaining` per move.
    pub fraction_of_remaining: u64,
    pub increment_fraction: f64,
    pub minimum_move_time_ms: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            safety_buffer_ms: defaults::SAFETY_BUFFER_MS,
            fraction_of_remaining: defaults::FRACTION_OF_REMAINING,
            increment_fraction: defaults::INCREMENT_FRACTION,
            minimum_move_time_ms: defaults::MINIMUM_MOVE_TIME_MS,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Cadence of principal-variation `info` lines during search.
    pub pv_interval_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.into(),
            pv_interval_ms: defaults::PV_INTERVAL_MS,
        }
    }
}
