//! Configuration loading logic.
//!
//! Handles loading config from files and applying environment variable overrides.

use crate::CentralConfig;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Standard locations to search for config.toml
pub const CONFIG_SEARCH_PATHS: &[&str] = &[
    "config.toml",    // Current directory
    "../config.toml", // Parent directory (when running from a member crate)
];

/// Load the central configuration from config.toml.
///
/// Searches for config.toml in the following order:
/// 1. Path specified by CHESSCOACH_CONFIG environment variable
/// 2. Current directory (config.toml)
/// 3. Parent directory (../config.toml)
///
/// After loading, environment variable overrides are applied.
pub fn load_config() -> CentralConfig {
    if let Ok(path) = std::env::var("CHESSCOACH_CONFIG") {
        let path = PathBuf::from(&path);
        if path.exists() {
            info!("Loading config from CHESSCOACH_CONFIG: {}", path.display());
            return load_from_path(&path);
        }
        warn!(
            "CHESSCOACH_CONFIG={} not found, searching defaults",
            path.display()
        );
    }

    for path_str in CONFIG_SEARCH_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading config from {}", path.display());
            return load_from_path(&path);
        }
    }

    debug!("No config.toml found, using built-in defaults");
    apply_env_overrides(CentralConfig::default())
}

/// Load configuration from a specific path.
pub fn load_from_path(path: &PathBuf) -> CentralConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => apply_env_overrides(config),
            Err(e) => {
                warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                apply_env_overrides(CentralConfig::default())
            }
        },
        Err(e) => {
            warn!("Failed to read {}: {}, using defaults", path.display(), e);
            apply_env_overrides(CentralConfig::default())
        }
    }
}

/// Macro to reduce env override boilerplate
macro_rules! env_override {
    // String field
    ($config:expr, $section:ident . $field:ident, $key:expr) => {
        if let Ok(v) = std::env::var($key) {
            $config.$section.$field = v;
        }
    };
    // Parseable field (u32, u64, f64, bool, etc.)
    ($config:expr, $section:ident . $field:ident, $key:expr, parse) => {
        if let Ok(v) =
            std::env::var($key).and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
        {
            $config.$section.$field = v;
        }
    };
}

/// Apply environment variable overrides to a configuration.
///
/// Environment variables follow the pattern: CHESSCOACH_<SECTION>_<KEY>
pub fn apply_env_overrides(mut config: CentralConfig) -> CentralConfig {
    // Search
    env_override!(config, search.pb_c_base, "CHESSCOACH_SEARCH_PB_C_BASE", parse);
    env_override!(config, search.pb_c_init, "CHESSCOACH_SEARCH_PB_C_INIT", parse);
    env_override!(config, search.fpu_default, "CHESSCOACH_SEARCH_FPU_DEFAULT", parse);
    env_override!(config, search.fpu_root, "CHESSCOACH_SEARCH_FPU_ROOT", parse);
    env_override!(
        config,
        search.virtual_loss_coefficient,
        "CHESSCOACH_SEARCH_VIRTUAL_LOSS_COEFFICIENT",
        parse
    );
    env_override!(
        config,
        search.backpropagation_threshold,
        "CHESSCOACH_SEARCH_BACKPROPAGATION_THRESHOLD",
        parse
    );
    env_override!(
        config,
        search.elimination_base_exponent,
        "CHESSCOACH_SEARCH_ELIMINATION_BASE_EXPONENT",
        parse
    );
    env_override!(
        config,
        search.linear_exploration_rate,
        "CHESSCOACH_SEARCH_LINEAR_EXPLORATION_RATE",
        parse
    );
    env_override!(
        config,
        search.linear_exploration_delay,
        "CHESSCOACH_SEARCH_LINEAR_EXPLORATION_DELAY",
        parse
    );
    env_override!(
        config,
        search.endgame_decay_divisor,
        "CHESSCOACH_SEARCH_ENDGAME_DECAY_DIVISOR",
        parse
    );
    env_override!(config, search.max_cache_ply, "CHESSCOACH_SEARCH_MAX_CACHE_PLY", parse);
    env_override!(
        config,
        search.move_diversity_enabled,
        "CHESSCOACH_SEARCH_MOVE_DIVERSITY_ENABLED",
        parse
    );
    env_override!(
        config,
        search.move_diversity_plies,
        "CHESSCOACH_SEARCH_MOVE_DIVERSITY_PLIES",
        parse
    );
    env_override!(
        config,
        search.mate_stop_seconds,
        "CHESSCOACH_SEARCH_MATE_STOP_SECONDS",
        parse
    );

    // Self-play
    env_override!(
        config,
        self_play.simulations_per_move,
        "CHESSCOACH_SELF_PLAY_SIMULATIONS_PER_MOVE",
        parse
    );
    env_override!(
        config,
        self_play.num_sampling_moves,
        "CHESSCOACH_SELF_PLAY_NUM_SAMPLING_MOVES",
        parse
    );
    env_override!(
        config,
        self_play.dirichlet_alpha,
        "CHESSCOACH_SELF_PLAY_DIRICHLET_ALPHA",
        parse
    );
    env_override!(
        config,
        self_play.exploration_fraction,
        "CHESSCOACH_SELF_PLAY_EXPLORATION_FRACTION",
        parse
    );

    // Cache
    env_override!(config, cache.request_gib, "CHESSCOACH_CACHE_REQUEST_GIB", parse);
    env_override!(config, cache.min_gib, "CHESSCOACH_CACHE_MIN_GIB", parse);
    env_override!(
        config,
        cache.network_flush_throttle_secs,
        "CHESSCOACH_CACHE_NETWORK_FLUSH_THROTTLE_SECS",
        parse
    );

    // Workers
    env_override!(config, workers.thread_count, "CHESSCOACH_WORKERS_THREAD_COUNT", parse);
    env_override!(config, workers.parallelism, "CHESSCOACH_WORKERS_PARALLELISM", parse);
    env_override!(
        config,
        workers.slowstart_nodes,
        "CHESSCOACH_WORKERS_SLOWSTART_NODES",
        parse
    );
    env_override!(
        config,
        workers.slowstart_threads,
        "CHESSCOACH_WORKERS_SLOWSTART_THREADS",
        parse
    );
    env_override!(
        config,
        workers.slowstart_parallelism,
        "CHESSCOACH_WORKERS_SLOWSTART_PARALLELISM",
        parse
    );

    // Time
    env_override!(config, time.safety_buffer_ms, "CHESSCOACH_TIME_SAFETY_BUFFER_MS", parse);
    env_override!(
        config,
        time.fraction_of_remaining,
        "CHESSCOACH_TIME_FRACTION_OF_REMAINING",
        parse
    );
    env_override!(
        config,
        time.increment_fraction,
        "CHESSCOACH_TIME_INCREMENT_FRACTION",
        parse
    );
    env_override!(
        config,
        time.minimum_move_time_ms,
        "CHESSCOACH_TIME_MINIMUM_MOVE_TIME_MS",
        parse
    );

    // Logging
    env_override!(config, logging.level, "CHESSCOACH_LOGGING_LEVEL");
    env_override!(config, logging.pv_interval_ms, "CHESSCOACH_LOGGING_PV_INTERVAL_MS", parse);

    config
}
