//! Centralized configuration loading from config.toml.
//!
//! This crate provides configuration structs and loading logic shared
//! across the engine crates and the UCI front end.
//!
//! # Configuration Priority
//!
//! Settings are loaded with the following priority (highest to lowest):
//! 1. Environment variables (`CHESSCOACH_<SECTION>_<KEY>`)
//! 2. config.toml file
//! 3. Built-in defaults
//!
//! # Environment Variable Override Pattern
//!
//! ```text
//! CHESSCOACH_<SECTION>_<KEY>=value
//!
//! Examples:
//!     CHESSCOACH_CACHE_REQUEST_GIB=8
//!     CHESSCOACH_WORKERS_THREAD_COUNT=4
//!     CHESSCOACH_SEARCH_PB_C_INIT=1.5
//! ```

mod defaults;
mod loader;
mod structs;

pub use defaults::*;
pub use loader::{apply_env_overrides, load_config, load_from_path, CONFIG_SEARCH_PATHS};
pub use structs::*;

#[cfg(test)]
mod tests;
