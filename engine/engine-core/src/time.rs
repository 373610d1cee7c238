//! Time control carried by a `go` command.

use crate::moves::EncodedMove;

/// Search limits parsed from UCI `go`.
///
/// All durations are milliseconds. Zero means "not specified" for the
/// optional fields; `infinite` overrides everything except an explicit stop.
#[derive(Debug, Clone, Default)]
pub struct TimeControl {
    pub infinite: bool,
    pub ponder: bool,
    pub move_time_ms: u64,
    /// Remaining clock per side, indexed by `Color as usize`.
    pub time_remaining_ms: [u64; 2],
    /// Increment per side, indexed by `Color as usize`.
    pub increment_ms: [u64; 2],
    pub moves_to_go: u32,
    pub depth: u32,
    pub nodes: u64,
    /// Stop as soon as a mate in at most this many moves is proven.
    pub mate: u32,
    /// Restrict the root to these moves when non-empty.
    pub search_moves: Vec<EncodedMove>,
}

impl TimeControl {
    pub fn infinite() -> Self {
        TimeControl {
            infinite: true,
            ..Default::default()
        }
    }

    pub fn move_time(ms: u64) -> Self {
        TimeControl {
            move_time_ms: ms,
            ..Default::default()
        }
    }

    pub fn nodes(nodes: u64) -> Self {
        TimeControl {
            nodes,
            ..Default::default()
        }
    }

    /// True when no clock, node, depth or mate limit is in effect.
    pub fn is_unbounded(&self) -> bool {
        self.infinite
            || (self.move_time_ms == 0
                && self.time_remaining_ms == [0, 0]
                && self.nodes == 0
                && self.depth == 0
                && self.mate == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded() {
        assert!(TimeControl::infinite().is_unbounded());
        assert!(TimeControl::default().is_unbounded());
        assert!(!TimeControl::move_time(1000).is_unbounded());
        assert!(!TimeControl::nodes(800).is_unbounded());
    }
}
