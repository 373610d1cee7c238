//! Game shadows and the expansion/evaluation pipeline.
//!
//! A `GameShadow` is the cheap, per-simulation view of the shared tree: a
//! node pointer plus a private copy of the position that descends with the
//! simulation. Expansion turns an unexpanded leaf into an internal node —
//! terminal detection, cache probe, evaluator hand-off, prior softmax,
//! child allocation, tablebase probing — driven as a two-phase state
//! machine so a worker can park a leaf while its batch is on the wire.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use engine_core::{
    ChessPosition, EncodedMove, InputPlanes, Move, Tablebase, WdlBound, VALUE_DRAW, VALUE_LOSS,
};

use crate::cache::{CacheProbe, PredictionCache, PredictionCacheChunk, MAX_CACHE_MOVES};
use crate::evaluator::PolicyLogits;
use crate::node::{Bound, Node, TerminalValue};
use crate::params::{SearchMode, SearchParams};

/// Per-slot coroutine state. `WaitingForPrediction` parks the simulation
/// between image submission and the evaluator's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Working,
    WaitingForPrediction,
    Finished,
}

/// Shared, read-only context threaded through a search.
pub struct SearchContext<'a> {
    pub params: &'a SearchParams,
    pub cache: &'a PredictionCache,
    pub tablebase: &'a dyn Tablebase,
    /// Root move filter from `go searchmoves`; empty means unrestricted.
    pub search_moves: &'a [EncodedMove],
    /// Release-stored whenever a best-child pointer moves, so the PV
    /// printer knows to re-read the line.
    pub pv_changed: &'a AtomicBool,
    /// Tablebase probes that produced a verdict, for `info ... tbhits`.
    pub tb_hits: &'a AtomicU64,
}

/// A descent view over the shared tree: node pointer plus private
/// position. Snapshot with `scratch` at the top of every simulation.
pub struct GameShadow<'t> {
    node: &'t Node,
    position: ChessPosition,
    search_root_ply: u32,
}

impl<'t> GameShadow<'t> {
    pub fn new(node: &'t Node, position: ChessPosition) -> GameShadow<'t> {
        let search_root_ply = position.ply();
        GameShadow {
            node,
            position,
            search_root_ply,
        }
    }

    /// Clone for one simulation; the copy's search root is wherever this
    /// shadow currently stands.
    pub fn scratch(&self) -> GameShadow<'t> {
        GameShadow {
            node: self.node,
            position: self.position.clone(),
            search_root_ply: self.position.ply(),
        }
    }

    #[inline]
    pub fn node(&self) -> &'t Node {
        self.node
    }

    #[inline]
    pub fn position(&self) -> &ChessPosition {
        &self.position
    }

    #[inline]
    pub fn ply_to_search_root(&self) -> u32 {
        self.position.ply() - self.search_root_ply
    }

    #[inline]
    pub fn is_at_search_root(&self) -> bool {
        self.position.ply() == self.search_root_ply
    }

    /// Follow a selected child: apply its move and re-point the shadow.
    pub fn descend_into(&mut self, child: &'t Node) {
        self.position
            .apply_encoded(child.mv())
            .expect("tree moves are legal by construction");
        self.node = child;
    }
}

/// Scratch buffers one slot reuses across simulations.
#[derive(Default)]
pub struct ExpansionScratch {
    pub moves: Vec<Move>,
    pub priors: Vec<f32>,
    pub image_key: u64,
}

/// First-phase outcome of expanding a leaf.
pub enum ExpandResult<'c> {
    /// The leaf produced a value without the evaluator: proven terminal,
    /// repetition draw, or cache hit. Value is from the perspective of the
    /// leaf position's side to move.
    Evaluated { value: f32, newly_mate: bool },
    /// Another thread owns this expansion; abort the simulation.
    RaceLost,
    /// The input image is filled; park until the batch returns.
    NeedsPrediction {
        store: Option<&'c PredictionCacheChunk>,
    },
}

/// Steps 1–8 of expanding `shadow`'s leaf: terminal checks, repetition
/// rules, the expansion CAS, and the cache probe. Fills `image` when the
/// evaluator is needed.
pub fn begin_expansion<'c>(
    context: &SearchContext<'c>,
    shadow: &GameShadow<'_>,
    scratch: &mut ExpansionScratch,
    image: &mut InputPlanes,
) -> ExpandResult<'c> {
    let node = shadow.node();
    let position = shadow.position();

    // A known-terminal leaf stays a leaf; answer immediately on repeat
    // visits without regenerating moves.
    let known = node.terminal_value();
    if known.is_terminal() {
        return ExpandResult::Evaluated {
            value: known.immediate_value(),
            newly_mate: false,
        };
    }

    scratch.moves.clear();
    scratch.moves.extend(position.legal_moves());

    if scratch.moves.is_empty() {
        if position.in_check() {
            let newly_mate = node.try_set_mate(1);
            return ExpandResult::Evaluated {
                value: VALUE_LOSS,
                newly_mate,
            };
        }
        node.set_draw();
        return ExpandResult::Evaluated {
            value: VALUE_DRAW,
            newly_mate: false,
        };
    }

    // Draw detection mirrors the pruning Stockfish does: a threefold
    // anywhere or the fifty-move rule is a hard terminal; a twofold
    // strictly after the search root scores as a draw but is NOT recorded
    // on the node, because advancing the root later can break the cycle.
    let repetition = position.repetition_distance();
    if position.halfmove_clock() > 99 || repetition < 0 {
        node.set_draw();
        return ExpandResult::Evaluated {
            value: VALUE_DRAW,
            newly_mate: false,
        };
    }
    if repetition > 0 && (repetition as u32) < shadow.ply_to_search_root() {
        return ExpandResult::Evaluated {
            value: VALUE_DRAW,
            newly_mate: false,
        };
    }

    if !node.try_begin_expansion() {
        return ExpandResult::RaceLost;
    }

    // Cache probe. Self-play only pays for cache traffic near the root,
    // where positions recur across games.
    scratch.image_key = position.fingerprint();
    let move_count = scratch.moves.len();
    let probe_allowed = move_count <= MAX_CACHE_MOVES
        && (context.params.mode == SearchMode::Search
            || position.ply() <= context.params.max_cache_ply);

    let mut store = None;
    if probe_allowed {
        scratch.priors.resize(move_count, 0.0);
        match context
            .cache
            .try_get(scratch.image_key, move_count, &mut scratch.priors)
        {
            CacheProbe::Hit { value } => {
                // Root filtering still applies to cached priors.
                finish_expansion(context, shadow, scratch, Some(context.search_moves));
                return ExpandResult::Evaluated {
                    value,
                    newly_mate: false,
                };
            }
            CacheProbe::Miss { store: chunk } => store = chunk,
        }
    }

    position.generate_image(image);
    ExpandResult::NeedsPrediction { store }
}

/// Second phase, entered when the evaluator's batch lands: convert logits
/// to priors, store into the cache, then build the children.
/// Returns the value to backpropagate (side-to-move perspective).
pub fn finish_evaluation(
    context: &SearchContext<'_>,
    shadow: &GameShadow<'_>,
    scratch: &mut ExpansionScratch,
    policy: &PolicyLogits,
    value: f32,
    store: Option<&PredictionCacheChunk>,
) -> f32 {
    let position = shadow.position();

    scratch.priors.clear();
    scratch.priors.extend(
        scratch
            .moves
            .iter()
            .map(|m| policy.logits[position.policy_index(m) as usize]),
    );
    softmax(&mut scratch.priors);

    // Store before any root filtering: the cache is keyed by position, not
    // by this search's move restrictions.
    if let Some(chunk) = store {
        context.cache.put(
            chunk,
            scratch.image_key,
            value,
            scratch.moves.len(),
            &scratch.priors,
        );
    }

    finish_expansion(context, shadow, scratch, Some(context.search_moves));
    value
}

/// Shared tail of both expansion paths: optional root move filtering,
/// child-array allocation with FPU seeding, tablebase probing. The array
/// is attached but NOT yet published; the driver release-stores
/// `Expanded` once root preparation is done.
fn finish_expansion(
    context: &SearchContext<'_>,
    shadow: &GameShadow<'_>,
    scratch: &mut ExpansionScratch,
    root_filter: Option<&[EncodedMove]>,
) {
    let node = shadow.node();
    let params = context.params;

    // `go searchmoves` restricts the root's children; priors renormalise
    // over what survives.
    if let Some(filter) = root_filter {
        if !filter.is_empty() && shadow.is_at_search_root() {
            let mut kept = 0;
            for i in 0..scratch.moves.len() {
                if filter.contains(&EncodedMove::encode(&scratch.moves[i])) {
                    scratch.moves.swap(kept, i);
                    scratch.priors.swap(kept, i);
                    kept += 1;
                }
            }
            if kept > 0 {
                scratch.moves.truncate(kept);
                scratch.priors.truncate(kept);
                let sum: f32 = scratch.priors.iter().sum();
                if sum > 0.0 {
                    for prior in &mut scratch.priors {
                        *prior /= sum;
                    }
                }
            }
        }
    }

    let fpu = if shadow.is_at_search_root() {
        params.fpu_root
    } else {
        params.fpu_default
    };
    let children: Vec<Node> = scratch
        .moves
        .iter()
        .zip(scratch.priors.iter())
        .map(|(m, &prior)| Node::new(EncodedMove::encode(m), prior, fpu))
        .collect();
    node.attach_children(children.into_boxed_slice());

    probe_tablebase_for_children(context, shadow, scratch);
}

/// WDL-probe each child position when few enough pieces remain, and pin
/// the verdicts onto the fresh children.
fn probe_tablebase_for_children(
    context: &SearchContext<'_>,
    shadow: &GameShadow<'_>,
    scratch: &ExpansionScratch,
) {
    let position = shadow.position();
    if position.piece_count() > context.tablebase.max_pieces() {
        return;
    }

    for (child, m) in shadow.node().attached_children().iter().zip(&scratch.moves) {
        let mut child_position = position.clone();
        child_position.apply_move(m);
        if let Some(verdict) = context.tablebase.probe_wdl(&child_position, false) {
            child.set_tablebase_rank_bound(verdict.rank, wdl_to_bound(verdict.bound));
            context.tb_hits.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub(crate) fn wdl_to_bound(bound: WdlBound) -> Bound {
    match bound {
        WdlBound::Upper => Bound::Upper,
        WdlBound::Lower => Bound::Lower,
        WdlBound::Exact => Bound::Exact,
    }
}

/// Numerically stable in-place softmax (log-sum-exp form).
pub fn softmax(distribution: &mut [f32]) {
    if distribution.is_empty() {
        return;
    }
    let max = distribution.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum: f32 = distribution.iter().map(|&logit| (logit - max).exp()).sum();
    let log_sum_exp = exp_sum.ln() + max;
    for logit in distribution.iter_mut() {
        *logit = (*logit - log_sum_exp).exp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::PolicyLogits;
    use engine_core::NullTablebase;

    static PV_CHANGED: AtomicBool = AtomicBool::new(false);
    static TB_HITS: AtomicU64 = AtomicU64::new(0);

    fn context<'a>(
        params: &'a SearchParams,
        cache: &'a PredictionCache,
        tablebase: &'a NullTablebase,
    ) -> SearchContext<'a> {
        SearchContext {
            params,
            cache,
            tablebase,
            search_moves: &[],
            pv_changed: &PV_CHANGED,
            tb_hits: &TB_HITS,
        }
    }

    #[test]
    fn test_softmax_uniform_and_peaked() {
        let mut flat = vec![0.0f32; 4];
        softmax(&mut flat);
        for p in &flat {
            assert!((p - 0.25).abs() < 1e-6);
        }

        let mut peaked = vec![10.0f32, 0.0, 0.0];
        softmax(&mut peaked);
        assert!(peaked[0] > 0.99);
        let sum: f32 = peaked.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_checkmate_leaf_proves_mate() {
        let params = SearchParams::for_testing();
        let cache = PredictionCache::new();
        let tablebase = NullTablebase;
        let context = context(&params, &cache, &tablebase);

        // Fool's mate delivered: white is mated.
        let position =
            ChessPosition::from_fen("rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3")
                .unwrap();
        let node = Node::new_root(0.0);
        let shadow = GameShadow::new(&node, position);
        let mut scratch = ExpansionScratch::default();
        let mut image = InputPlanes::default();

        match begin_expansion(&context, &shadow, &mut scratch, &mut image) {
            ExpandResult::Evaluated { value, newly_mate } => {
                assert_eq!(value, VALUE_LOSS);
                assert!(newly_mate);
            }
            _ => panic!("checkmate must evaluate immediately"),
        }
        assert_eq!(node.terminal_value(), TerminalValue::MateIn(1));

        // Second visit: already proven, no new mate signal.
        match begin_expansion(&context, &shadow, &mut scratch, &mut image) {
            ExpandResult::Evaluated { newly_mate, .. } => assert!(!newly_mate),
            _ => panic!("known terminal must evaluate immediately"),
        }
    }

    #[test]
    fn test_stalemate_leaf_draws() {
        let params = SearchParams::for_testing();
        let cache = PredictionCache::new();
        let tablebase = NullTablebase;
        let context = context(&params, &cache, &tablebase);

        // Black to move, stalemated.
        let position = ChessPosition::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
        let node = Node::new_root(0.0);
        let shadow = GameShadow::new(&node, position);
        let mut scratch = ExpansionScratch::default();
        let mut image = InputPlanes::default();

        match begin_expansion(&context, &shadow, &mut scratch, &mut image) {
            ExpandResult::Evaluated { value, newly_mate } => {
                assert_eq!(value, VALUE_DRAW);
                assert!(!newly_mate);
            }
            _ => panic!("stalemate must evaluate immediately"),
        }
        assert_eq!(node.terminal_value(), TerminalValue::Draw);
    }

    #[test]
    fn test_race_lost_when_already_expanding() {
        let params = SearchParams::for_testing();
        let cache = PredictionCache::new();
        let tablebase = NullTablebase;
        let context = context(&params, &cache, &tablebase);

        let node = Node::new_root(0.0);
        assert!(node.try_begin_expansion());

        let shadow = GameShadow::new(&node, ChessPosition::new());
        let mut scratch = ExpansionScratch::default();
        let mut image = InputPlanes::default();
        assert!(matches!(
            begin_expansion(&context, &shadow, &mut scratch, &mut image),
            ExpandResult::RaceLost
        ));
    }

    #[test]
    fn test_full_pipeline_with_uniform_logits() {
        let params = SearchParams::for_testing();
        let cache = PredictionCache::new();
        let tablebase = NullTablebase;
        let context = context(&params, &cache, &tablebase);

        let node = Node::new_root(0.0);
        let shadow = GameShadow::new(&node, ChessPosition::new());
        let mut scratch = ExpansionScratch::default();
        let mut image = InputPlanes::default();

        let store = match begin_expansion(&context, &shadow, &mut scratch, &mut image) {
            ExpandResult::NeedsPrediction { store } => store,
            _ => panic!("fresh leaf must need a prediction"),
        };
        assert!(store.is_none(), "no cache allocated");

        let policy = PolicyLogits::default();
        let value = finish_evaluation(&context, &shadow, &mut scratch, &policy, 0.5, store);
        assert_eq!(value, 0.5);

        node.publish_expanded();
        let children = node.children();
        assert_eq!(children.len(), 20);
        for child in children {
            assert!((child.prior() - 0.05).abs() < 1e-3);
            assert_eq!(child.visit_count(), 0);
        }
    }

    #[test]
    fn test_cache_hit_skips_network() {
        let params = SearchParams::for_testing();
        let mut cache = PredictionCache::new();
        cache.allocate(1, 1).unwrap();
        let tablebase = NullTablebase;
        let context = context(&params, &cache, &tablebase);

        // First expansion goes through the network path and stores.
        let node = Node::new_root(0.0);
        let shadow = GameShadow::new(&node, ChessPosition::new());
        let mut scratch = ExpansionScratch::default();
        let mut image = InputPlanes::default();

        let store = match begin_expansion(&context, &shadow, &mut scratch, &mut image) {
            ExpandResult::NeedsPrediction { store } => store,
            _ => panic!("fresh leaf must need a prediction"),
        };
        let policy = PolicyLogits::default();
        finish_evaluation(&context, &shadow, &mut scratch, &policy, 0.625, store);
        node.publish_expanded();

        // A second tree over the same position hits the cache.
        let node2 = Node::new_root(0.0);
        let shadow2 = GameShadow::new(&node2, ChessPosition::new());
        let mut scratch2 = ExpansionScratch::default();
        match begin_expansion(&context, &shadow2, &mut scratch2, &mut image) {
            ExpandResult::Evaluated { value, .. } => assert!((value - 0.625).abs() < 1e-6),
            _ => panic!("second expansion must hit the cache"),
        }
        node2.publish_expanded();
        assert_eq!(node2.children().len(), 20);
        for (a, b) in node.children().iter().zip(node2.children()) {
            assert_eq!(a.mv(), b.mv());
            assert!((a.prior() - b.prior()).abs() < 2.0 / 65534.0);
        }
    }

    #[test]
    fn test_twofold_after_root_draws_without_terminal() {
        let params = SearchParams::for_testing();
        let cache = PredictionCache::new();
        let tablebase = NullTablebase;
        let context = context(&params, &cache, &tablebase);

        // Search root at the start position. The descent plays Nf3, then
        // black's knight out and back: the position after Nf3 recurs at
        // distance 2, strictly after the root (ply_to_search_root 3).
        let node = Node::new_root(0.0);
        let mut shadow = GameShadow::new(&node, ChessPosition::new());
        let mut scratch = ExpansionScratch::default();
        let mut image = InputPlanes::default();
        for token in ["g1f3", "b8c6", "c6b8"] {
            let m = shadow.position.parse_uci_move(token).unwrap();
            shadow.position.apply_move(&m);
        }
        assert_eq!(shadow.ply_to_search_root(), 3);
        assert_eq!(shadow.position.repetition_distance(), 2);

        match begin_expansion(&context, &shadow, &mut scratch, &mut image) {
            ExpandResult::Evaluated { value, newly_mate } => {
                assert_eq!(value, VALUE_DRAW);
                assert!(!newly_mate);
            }
            _ => panic!("twofold after the root must score as a draw"),
        }
        // ... but the node is NOT marked terminal: a later root may sit
        // past the first occurrence and break the cycle.
        assert_eq!(node.terminal_value(), TerminalValue::NonTerminal);

        // Re-root one ply before the leaf: the earlier occurrence now
        // precedes the search root, and the same leaf expands normally.
        let mut advanced_root = ChessPosition::new();
        for token in ["g1f3", "b8c6"] {
            let m = advanced_root.parse_uci_move(token).unwrap();
            advanced_root.apply_move(&m);
        }
        let node2 = Node::new_root(0.0);
        let mut rerooted = GameShadow::new(&node2, advanced_root);
        let m = rerooted.position.parse_uci_move("c6b8").unwrap();
        rerooted.position.apply_move(&m);
        assert_eq!(rerooted.ply_to_search_root(), 1);
        assert_eq!(rerooted.position.repetition_distance(), 2);

        match begin_expansion(&context, &rerooted, &mut scratch, &mut image) {
            ExpandResult::NeedsPrediction { .. } => {}
            _ => panic!("repetition before the root must expand normally"),
        }
        assert_eq!(node2.terminal_value(), TerminalValue::NonTerminal);
    }
}
