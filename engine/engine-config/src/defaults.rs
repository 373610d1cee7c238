//! Default configuration values.
//!
//! Single source of truth for every tunable default across the engine.

// Search defaults
pub const PB_C_BASE: f64 = 19652.0;
pub const PB_C_INIT: f64 = 1.25;
pub const FPU_DEFAULT: f64 = 0.0;
pub const FPU_ROOT: f64 = 1.0;
pub const VIRTUAL_LOSS_COEFFICIENT: f64 = 1.0;
pub const BACKPROPAGATION_THRESHOLD: f64 = 0.1;
pub const ELIMINATION_BASE_EXPONENT: u32 = 5;
pub const LINEAR_EXPLORATION_RATE: f64 = 10.0;
pub const LINEAR_EXPLORATION_DELAY: f64 = 20.0;
pub const MOVING_AVERAGE_BUILD: f64 = 1.0;
pub const MOVING_AVERAGE_CAP: u32 = 65536;
pub const ENDGAME_DECAY_DIVISOR: f64 = 250.0;
pub const MAX_CACHE_PLY: u32 = 30;
pub const MOVE_DIVERSITY_ENABLED: bool = true;
pub const MOVE_DIVERSITY_PLIES: u32 = 6;
pub const MOVE_DIVERSITY_TEMPERATURE: f64 = 1.5;
pub const MOVE_DIVERSITY_VALUE_DELTA: f64 = 0.05;
pub const MINIMAX_MATERIAL_THRESHOLD: u32 = 10;
pub const MINIMAX_VISITS_RECURSE: i32 = 100;
pub const MINIMAX_VISITS_IGNORE: f64 = 0.02;
pub const MATE_STOP_SECONDS: u64 = 3;

// Self-play defaults
pub const SIMULATIONS_PER_MOVE: u32 = 800;
pub const NUM_SAMPLING_MOVES: u32 = 30;
pub const DIRICHLET_ALPHA: f64 = 0.3;
pub const EXPLORATION_FRACTION: f64 = 0.25;

// Prediction cache defaults
pub const CACHE_REQUEST_GIB: usize = 2;
pub const CACHE_MIN_GIB: usize = 1;
pub const NETWORK_FLUSH_THROTTLE_SECS: u64 = 300;

// Worker defaults
pub const WORKER_THREAD_COUNT: usize = 2;
pub const WORKER_PARALLELISM: usize = 64;
pub const SLOWSTART_NODES: i32 = 1000;
pub const SLOWSTART_THREADS: usize = 1;
pub const SLOWSTART_PARALLELISM: usize = 8;

// Time management defaults
pub const SAFETY_BUFFER_MS: u64 = 100;
pub const FRACTION_OF_REMAINING: u64 = 20;
pub const INCREMENT_FRACTION: f64 = 0.8;
pub const MINIMUM_MOVE_TIME_MS: u64 = 50;

// Logging defaults
pub const LOG_LEVEL: &str = "info";
pub const PV_INTERVAL_MS: u64 = 500;
