//! Tests for the configuration module.

use super::*;

#[test]
fn test_default_config() {
    let config = CentralConfig::default();
    assert!((config.search.pb_c_base - 19652.0).abs() < f64::EPSILON);
    assert!((config.search.pb_c_init - 1.25).abs() < f64::EPSILON);
    assert!((config.search.fpu_root - 1.0).abs() < f64::EPSILON);
    assert_eq!(config.cache.request_gib, 2);
    assert_eq!(config.cache.min_gib, 1);
    assert_eq!(config.workers.thread_count, 2);
    assert_eq!(config.workers.parallelism, 64);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_self_play_defaults() {
    let config = CentralConfig::default();
    assert_eq!(config.self_play.simulations_per_move, 800);
    assert_eq!(config.self_play.num_sampling_moves, 30);
    assert!((config.self_play.dirichlet_alpha - 0.3).abs() < f64::EPSILON);
    assert!((config.self_play.exploration_fraction - 0.25).abs() < f64::EPSILON);
}

#[test]
fn test_time_defaults() {
    let config = CentralConfig::default();
    assert_eq!(config.time.safety_buffer_ms, 100);
    assert_eq!(config.time.fraction_of_remaining, 20);
    assert!((config.time.increment_fraction - 0.8).abs() < f64::EPSILON);
    assert_eq!(config.time.minimum_move_time_ms, 50);
}

#[test]
fn test_env_overrides() {
    std::env::set_var("CHESSCOACH_CACHE_REQUEST_GIB", "8");
    std::env::set_var("CHESSCOACH_WORKERS_THREAD_COUNT", "7");
    std::env::set_var("CHESSCOACH_SEARCH_PB_C_INIT", "1.5");

    let config = load_config();
    assert_eq!(config.cache.request_gib, 8);
    assert_eq!(config.workers.thread_count, 7);
    assert!((config.search.pb_c_init - 1.5).abs() < f64::EPSILON);

    std::env::remove_var("CHESSCOACH_CACHE_REQUEST_GIB");
    std::env::remove_var("CHESSCOACH_WORKERS_THREAD_COUNT");
    std::env::remove_var("CHESSCOACH_SEARCH_PB_C_INIT");
}

#[test]
fn test_parse_config_toml() {
    let toml_content = r#"
[search]
pb_c_init = 2.0
move_diversity_enabled = false

[cache]
request_gib = 4
min_gib = 2

[workers]
thread_count = 8
"#;
    let config: CentralConfig = toml::from_str(toml_content).unwrap();
    assert!((config.search.pb_c_init - 2.0).abs() < f64::EPSILON);
    assert!(!config.search.move_diversity_enabled);
    assert_eq!(config.cache.request_gib, 4);
    assert_eq!(config.cache.min_gib, 2);
    assert_eq!(config.workers.thread_count, 8);
}

#[test]
fn test_partial_config() {
    let toml_content = r#"
[cache]
request_gib = 16
"#;
    let config: CentralConfig = toml::from_str(toml_content).unwrap();
    assert_eq!(config.cache.request_gib, 16);
    assert_eq!(config.cache.min_gib, 1); // Default
    assert_eq!(config.workers.parallelism, 64); // Default
    assert!((config.search.pb_c_base - 19652.0).abs() < f64::EPSILON); // Default
}
