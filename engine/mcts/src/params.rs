//! Search parameters.
//!
//! A flattened, `f32` view of the central configuration, passed by
//! reference through the hot search paths.

use engine_config::CentralConfig;

/// Whether the tree is being driven by a UCI search or by self-play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Search,
    SelfPlay,
}

/// Tuning knobs for a search. See `engine-config` for documentation of the
/// individual values; this struct only changes representation.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub mode: SearchMode,

    // PUCT
    pub pb_c_base: f32,
    pub pb_c_init: f32,
    pub fpu_default: f32,
    pub fpu_root: f32,
    pub virtual_loss_coefficient: f32,
    pub backpropagation_threshold: f32,
    pub elimination_base_exponent: u32,
    pub linear_exploration_rate: f32,
    pub linear_exploration_delay: f32,

    // Value accumulation
    pub moving_average_build: f32,
    pub moving_average_cap: u32,
    pub endgame_decay_divisor: f32,

    // Cache gating
    pub max_cache_ply: u32,

    // Self-play
    pub simulations_per_move: u32,
    pub num_sampling_moves: u32,
    pub dirichlet_alpha: f32,
    pub exploration_fraction: f32,

    // Move selection
    pub move_diversity_enabled: bool,
    pub move_diversity_plies: u32,
    pub move_diversity_temperature: f32,
    pub move_diversity_value_delta: f32,
    pub minimax_material_threshold: u32,
    pub minimax_visits_recurse: i32,
    pub minimax_visits_ignore: f32,

    // Stopping
    pub mate_stop_seconds: u64,
}

impl SearchParams {
    pub fn from_config(config: &CentralConfig, mode: SearchMode) -> Self {
        let s = &config.search;
        let sp = &config.self_play;
        Self {
            mode,
            pb_c_base: s.pb_c_base as f32,
            pb_c_init: s.pb_c_init as f32,
            fpu_default: s.fpu_default as f32,
            fpu_root: s.fpu_root as f32,
            virtual_loss_coefficient: s.virtual_loss_coefficient as f32,
            backpropagation_threshold: s.backpropagation_threshold as f32,
            elimination_base_exponent: s.elimination_base_exponent,
            linear_exploration_rate: s.linear_exploration_rate as f32,
            linear_exploration_delay: s.linear_exploration_delay as f32,
            moving_average_build: s.moving_average_build as f32,
            moving_average_cap: s.moving_average_cap,
            endgame_decay_divisor: s.endgame_decay_divisor as f32,
            max_cache_ply: s.max_cache_ply,
            simulations_per_move: sp.simulations_per_move,
            num_sampling_moves: sp.num_sampling_moves,
            dirichlet_alpha: sp.dirichlet_alpha as f32,
            exploration_fraction: sp.exploration_fraction as f32,
            move_diversity_enabled: s.move_diversity_enabled,
            move_diversity_plies: s.move_diversity_plies,
            move_diversity_temperature: s.move_diversity_temperature as f32,
            move_diversity_value_delta: s.move_diversity_value_delta as f32,
            minimax_material_threshold: s.minimax_material_threshold,
            minimax_visits_recurse: s.minimax_visits_recurse,
            minimax_visits_ignore: s.minimax_visits_ignore as f32,
            mate_stop_seconds: s.mate_stop_seconds,
        }
    }

    /// Defaults in search mode.
    pub fn search() -> Self {
        Self::from_config(&CentralConfig::default(), SearchMode::Search)
    }

    /// Defaults in self-play mode.
    pub fn self_play() -> Self {
        Self::from_config(&CentralConfig::default(), SearchMode::SelfPlay)
    }

    /// Small, deterministic settings for unit tests: no Dirichlet noise,
    /// no diversity sampling, no elimination surprises.
    pub fn for_testing() -> Self {
        let mut params = Self::search();
        params.exploration_fraction = 0.0;
        params.move_diversity_enabled = false;
        params.simulations_per_move = 64;
        params
    }

    pub fn with_simulations(mut self, simulations: u32) -> Self {
        self.simulations_per_move = simulations;
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_matches_defaults() {
        let params = SearchParams::search();
        assert!((params.pb_c_base - 19652.0).abs() < 1e-3);
        assert!((params.pb_c_init - 1.25).abs() < 1e-6);
        assert!((params.fpu_root - 1.0).abs() < 1e-6);
        assert_eq!(params.mode, SearchMode::Search);
    }

    #[test]
    fn test_builders() {
        let params = SearchParams::for_testing()
            .with_simulations(128)
            .with_mode(SearchMode::SelfPlay);
        assert_eq!(params.simulations_per_move, 128);
        assert_eq!(params.mode, SearchMode::SelfPlay);
        assert!(params.exploration_fraction.abs() < 1e-6);
    }
}
