//! The MCTS driver.
//!
//! One simulation: snapshot the root, descend by PUCT under virtual loss,
//! expand the leaf, backpropagate. A simulation that needs the evaluator
//! parks in its slot (`WaitingForPrediction`) so the controller can batch
//! leaves across slots; a simulation that loses an expansion race or finds
//! every child blocked unwinds its virtual loss and vanishes.

use std::sync::atomic::Ordering;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma};
use tracing::trace;

use engine_core::{flip_value, flip_value_across, EncodedMove, InputPlanes, VALUE_DRAW};

use crate::cache::PredictionCacheChunk;
use crate::evaluator::PolicyLogits;
use crate::game::{
    begin_expansion, finish_evaluation, wdl_to_bound, ExpandResult, ExpansionScratch, GameShadow,
    SearchContext, SlotPhase,
};
use crate::node::{Expansion, Node, TerminalValue};
use crate::params::{SearchMode, SearchParams};
use crate::puct::PuctContext;
use crate::tree::GameTree;

/// One step of a simulation's root-to-leaf path. `index` is the node's
/// position in its parent's child array (`usize::MAX` for the root);
/// `weight` is the selective-backpropagation bit from selection.
pub struct PathEntry<'t> {
    pub node: &'t Node,
    pub index: usize,
    pub weight: u8,
}

/// Per-slot simulation state; slots live for the duration of one search.
pub struct SimulationSlot<'t> {
    pub phase: SlotPhase,
    pub shadow: Option<GameShadow<'t>>,
    pub path: Vec<PathEntry<'t>>,
    pub expansion: ExpansionScratch,
    pub image: InputPlanes,
    pub pending_store: Option<&'t PredictionCacheChunk>,
    pub failed_node_count: u64,
    pub completed_simulations: u64,
}

impl<'t> SimulationSlot<'t> {
    pub fn new() -> SimulationSlot<'t> {
        SimulationSlot {
            phase: SlotPhase::Working,
            shadow: None,
            path: Vec::with_capacity(64),
            expansion: ExpansionScratch::default(),
            image: InputPlanes::default(),
            pending_store: None,
            failed_node_count: 0,
            completed_simulations: 0,
        }
    }
}

impl<'t> Default for SimulationSlot<'t> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of driving one simulation as far as it will go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStatus {
    /// Backpropagated; the slot is free for the next simulation.
    Completed,
    /// Parked awaiting the evaluator batch.
    Yielded,
    /// Lost a race; virtual loss unwound, nothing learned.
    Aborted,
}

// ============================================================================
// Simulation driving
// ============================================================================

/// Run one simulation from `game`'s root. `elimination_fraction` is the
/// consumed share of the search budget.
pub fn start_simulation<'t>(
    context: &SearchContext<'t>,
    game: &GameShadow<'t>,
    slot: &mut SimulationSlot<'t>,
    elimination_fraction: f32,
    rng: &mut ChaCha20Rng,
) -> SimStatus {
    debug_assert_eq!(slot.phase, SlotPhase::Working);

    let mut scratch = game.scratch();
    slot.path.clear();
    let root = scratch.node();
    root.begin_visit();
    slot.path.push(PathEntry {
        node: root,
        index: usize::MAX,
        weight: 1,
    });
    let root_visits = root.visit_count();

    while scratch.node().expansion() == Expansion::Expanded {
        let puct = PuctContext::new(
            context.params,
            scratch.node(),
            root_visits,
            elimination_fraction,
        );
        let selected = match puct.select_child() {
            Some(selected) => selected,
            None => {
                fail_simulation(slot);
                return SimStatus::Aborted;
            }
        };
        scratch.descend_into(selected.node);
        selected.node.begin_visit();
        slot.path.push(PathEntry {
            node: selected.node,
            index: selected.index,
            weight: selected.weight,
        });
    }

    match begin_expansion(context, &scratch, &mut slot.expansion, &mut slot.image) {
        ExpandResult::RaceLost => {
            fail_simulation(slot);
            SimStatus::Aborted
        }
        ExpandResult::NeedsPrediction { store } => {
            slot.pending_store = store;
            slot.shadow = Some(scratch);
            slot.phase = SlotPhase::WaitingForPrediction;
            SimStatus::Yielded
        }
        ExpandResult::Evaluated { value, newly_mate } => {
            conclude_simulation(context, slot, scratch, value, newly_mate, rng);
            SimStatus::Completed
        }
    }
}

/// Continue a parked simulation with the evaluator's answer for its slot.
pub fn resume_simulation<'t>(
    context: &SearchContext<'t>,
    slot: &mut SimulationSlot<'t>,
    policy: &PolicyLogits,
    value: f32,
    rng: &mut ChaCha20Rng,
) {
    debug_assert_eq!(slot.phase, SlotPhase::WaitingForPrediction);
    let shadow = slot.shadow.take().expect("parked simulation has a shadow");
    let store = slot.pending_store.take();

    let value = finish_evaluation(context, &shadow, &mut slot.expansion, policy, value, store);
    slot.phase = SlotPhase::Working;
    conclude_simulation(context, slot, shadow, value, false, rng);
}

/// Abandon the in-flight simulation: unwind virtual loss along the path
/// and count the failure.
pub fn fail_simulation(slot: &mut SimulationSlot<'_>) {
    for entry in &slot.path {
        entry.node.abandon_visit();
    }
    slot.path.clear();
    slot.shadow = None;
    slot.pending_store = None;
    slot.phase = SlotPhase::Working;
    slot.failed_node_count += 1;
}

/// Steps 5–11 of a completed simulation: perspective flip, endgame decay,
/// backpropagation, mate proofs, PV maintenance, root preparation,
/// publication.
fn conclude_simulation<'t>(
    context: &SearchContext<'t>,
    slot: &mut SimulationSlot<'t>,
    scratch: GameShadow<'t>,
    value_side_to_move: f32,
    newly_mate: bool,
    rng: &mut ChaCha20Rng,
) {
    let leaf = scratch.node();
    debug_assert!(!value_side_to_move.is_nan());

    // Express the evaluation as the leaf node's value: the probability
    // that the move into the leaf works out for whoever played it.
    let mut value = flip_value(value_side_to_move);

    // Long no-progress stretches in simple endgames drift toward the
    // draw, unless a tablebase bound says otherwise.
    if leaf.bound() == crate::node::Bound::None {
        let decay = scratch.position().endgame_proportion()
            * scratch.position().halfmove_clock() as f32
            / context.params.endgame_decay_divisor;
        value += (VALUE_DRAW - value) * decay;
    }

    backpropagate(context.params, &slot.path, value);

    if newly_mate {
        backpropagate_mate(context, &slot.path);
    }

    update_principal_variation(context, &slot.path);

    if leaf.expansion() == Expansion::Expanding {
        if scratch.is_at_search_root() {
            prepare_expanded_root(context, &scratch, rng);
        }
        leaf.publish_expanded();
    }

    slot.completed_simulations += 1;
    trace!(
        depth = slot.path.len(),
        value = value_side_to_move,
        "simulation complete"
    );
    slot.path.clear();
}

// ============================================================================
// Backpropagation
// ============================================================================

/// Walk the path leaf-to-root folding `value` into each level.
///
/// `value` arrives in the leaf node's perspective and flips at every
/// level. The first weight-0 entry (a pure-exploration pick) switches the
/// remainder of the walk to visits-only, as does a first-sample draw after
/// it has re-seeded its siblings.
pub fn backpropagate(params: &SearchParams, path: &[PathEntry<'_>], mut value: f32) {
    let leaf_depth = path.len() - 1;
    let mut values_enabled = true;

    for (depth, entry) in path.iter().enumerate().rev() {
        let node = entry.node;
        node.complete_visit();

        if values_enabled && entry.weight == 0 {
            values_enabled = false;
        }
        if values_enabled {
            value = node.bounded_value(value);
            let new_weight = node.sample_value(
                value,
                params.moving_average_build,
                params.moving_average_cap,
            );

            // Draw-sibling FPU: a leaf whose very first sample is an exact
            // draw re-seeds its untouched siblings with the root's value,
            // then stops dragging its ancestors toward the draw.
            if depth == leaf_depth && depth >= 2 && new_weight == 1 && value == VALUE_DRAW {
                seed_draw_siblings(params, path, depth);
                values_enabled = false;
            }
        }
        value = flip_value(value);
    }
}

fn seed_draw_siblings(params: &SearchParams, path: &[PathEntry<'_>], leaf_depth: usize) {
    let root_value = path[0].node.value_average();
    let seed = flip_value_across(leaf_depth as u32, root_value);
    let parent = path[leaf_depth - 1].node;
    let leaf = path[leaf_depth].node;

    for sibling in parent.children() {
        if std::ptr::eq(sibling, leaf) {
            continue;
        }
        if sibling.value_weight() == 0 {
            sibling.replace_value_average(params.fpu_default, seed);
        }
    }
}

// ============================================================================
// Mate proofs
// ============================================================================

/// Propagate a fresh mate proof up the path.
///
/// A child proven `MateIn(n)` makes its parent `OpponentMateIn(n)` (the
/// parent's mover walked into it); a child proven `OpponentMateIn` only
/// worsens the parent if *every* child is a proven opponent mate, in which
/// case the parent is `MateIn(max + 1)`. The walk stops at the first level
/// that doesn't improve.
pub fn backpropagate_mate(context: &SearchContext<'_>, path: &[PathEntry<'_>]) {
    let mut depth = path.len() - 1;
    while depth > 0 {
        let child = path[depth].node;
        let parent = path[depth - 1].node;

        match child.terminal_value() {
            TerminalValue::MateIn(n) => {
                if !parent.try_set_opponent_mate(n) {
                    break;
                }
                // The parent just got worse: its grandparent's best child
                // may need to move off this line.
                if depth >= 2 {
                    fix_principal_variation(context, path[depth - 2].node);
                }
            }
            TerminalValue::OpponentMateIn(_) => {
                let children = parent.children();
                let mut slowest = 0u8;
                let mut all_proven = !children.is_empty();
                for sibling in children {
                    match sibling.terminal_value() {
                        TerminalValue::OpponentMateIn(m) => slowest = slowest.max(m),
                        _ => {
                            all_proven = false;
                            break;
                        }
                    }
                }
                if !all_proven || !parent.try_set_mate(slowest.saturating_add(1)) {
                    break;
                }
            }
            _ => break,
        }
        depth -= 1;
    }
}

// ============================================================================
// Principal variation
// ============================================================================

/// Lexicographic "better child" ordering: tablebase rank, then mate
/// category/distance, then visits.
fn child_ordering_key(node: &Node) -> (i16, i32, i32) {
    (
        node.tablebase_rank(),
        node.terminal_value().ordering_key(),
        node.visit_count(),
    )
}

/// Walk the just-backpropagated path and promote any node that now
/// outranks its parent's stored best child.
pub fn update_principal_variation(context: &SearchContext<'_>, path: &[PathEntry<'_>]) {
    let mut changed = false;
    for pair in path.windows(2) {
        let parent = pair[0].node;
        let child = pair[1].node;
        let child_index = pair[1].index;

        match parent.best_index() {
            None => {
                parent.store_best_index(child_index);
                changed = true;
            }
            Some(best) if best == child_index => {}
            Some(best) => {
                let incumbent = &parent.children()[best];
                if child_ordering_key(child) > child_ordering_key(incumbent) {
                    parent.store_best_index(child_index);
                    changed = true;
                }
            }
        }
    }
    if changed {
        context.pv_changed.store(true, Ordering::Release);
    }
}

/// Full re-scan of one node's children; used when a line just *worsened*
/// (a mate against was proven) and the incremental rule cannot help.
pub fn fix_principal_variation(context: &SearchContext<'_>, node: &Node) {
    let children = node.children();
    if children.is_empty() {
        return;
    }
    let mut best = 0;
    for (index, child) in children.iter().enumerate() {
        if child_ordering_key(child) > child_ordering_key(&children[best]) {
            best = index;
        }
    }
    if node.best_index() != Some(best) {
        node.store_best_index(best);
        context.pv_changed.store(true, Ordering::Release);
    }
}

// ============================================================================
// Root preparation
// ============================================================================

/// One-time setup when the search root itself finishes expanding: reset
/// the root's statistics, mix in exploration noise (self-play), pin root
/// tablebase verdicts (search), and seed untouched children with the root
/// FPU.
fn prepare_expanded_root(context: &SearchContext<'_>, scratch: &GameShadow<'_>, rng: &mut ChaCha20Rng) {
    let root = scratch.node();
    let params = context.params;

    root.store_visit_count(1);
    root.store_value_average(params.fpu_root);
    root.store_value_weight(0);

    let children = root.attached_children();

    if params.mode == SearchMode::SelfPlay && params.exploration_fraction > 0.0 {
        add_exploration_noise(params, children, rng);
    }

    if params.mode == SearchMode::Search {
        if let Some(verdicts) = context.tablebase.probe_root(scratch.position()) {
            for (m, verdict) in verdicts {
                let encoded = EncodedMove::encode(&m);
                if let Some(child) = children.iter().find(|c| c.mv() == encoded) {
                    child.set_tablebase_rank_bound(verdict.rank, wdl_to_bound(verdict.bound));
                    context.tb_hits.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    for child in children {
        if child.value_weight() == 0 && child.bound() == crate::node::Bound::None {
            child.store_value_average(params.fpu_root);
        }
    }
}

/// Dirichlet noise over the root priors via normalised Gamma samples.
fn add_exploration_noise(params: &SearchParams, children: &[Node], rng: &mut ChaCha20Rng) {
    if children.is_empty() {
        return;
    }
    let gamma = Gamma::new(params.dirichlet_alpha as f64, 1.0).expect("alpha > 0");
    let mut noise: Vec<f32> = (0..children.len())
        .map(|_| gamma.sample(rng) as f32)
        .collect();
    let sum: f32 = noise.iter().sum();
    if sum > 0.0 {
        for n in &mut noise {
            *n /= sum;
        }
    }

    let fraction = params.exploration_fraction;
    for (child, noise) in children.iter().zip(noise) {
        child.store_prior(child.prior() * (1.0 - fraction) + noise * fraction);
    }
}

// ============================================================================
// Move selection
// ============================================================================

/// Pick the move to play from a finished search.
pub fn select_move(
    context: &SearchContext<'_>,
    tree: &GameTree,
    rng: &mut ChaCha20Rng,
) -> Option<EncodedMove> {
    let root = tree.root();
    let children = root.children();
    if children.is_empty() {
        return None;
    }
    let params = context.params;
    let ply = tree.position().ply();

    let best_index = match root.best_index() {
        Some(best) => best,
        None => {
            // Nothing backpropagated yet: fall back to the raw priors.
            let mut best = 0;
            for (index, child) in children.iter().enumerate() {
                if child.quantized_prior() > children[best].quantized_prior() {
                    best = index;
                }
            }
            return Some(children[best].mv());
        }
    };

    if params.mode == SearchMode::SelfPlay && ply < params.num_sampling_moves {
        return Some(sample_by_visits(children, 1.0, rng));
    }

    if params.mode == SearchMode::Search
        && params.move_diversity_enabled
        && ply < params.move_diversity_plies
    {
        return Some(sample_with_diversity(params, children, best_index, rng));
    }

    if params.mode == SearchMode::Search
        && tree.position().non_pawn_material() <= params.minimax_material_threshold
    {
        return Some(select_by_posthoc_minimax(params, root, best_index));
    }

    Some(children[best_index].mv())
}

/// Visit-count-proportional sampling with a temperature.
fn sample_by_visits(children: &[Node], temperature: f32, rng: &mut ChaCha20Rng) -> EncodedMove {
    let weights: Vec<f64> = children
        .iter()
        .map(|c| (c.visit_count().max(0) as f64).powf(1.0 / temperature as f64))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return children[0].mv();
    }
    let mut sample = rng.gen_range(0.0..total);
    for (child, weight) in children.iter().zip(&weights) {
        if sample < *weight {
            return child.mv();
        }
        sample -= weight;
    }
    children[children.len() - 1].mv()
}

/// Opening diversity: sample among children whose value sits within a
/// delta of the best, restricted to the best child's tablebase rank and
/// mate category, with re-exponentiated visits.
fn sample_with_diversity(
    params: &SearchParams,
    children: &[Node],
    best_index: usize,
    rng: &mut ChaCha20Rng,
) -> EncodedMove {
    let best = &children[best_index];
    let best_value = best.value_average();
    let best_rank = best.tablebase_rank();
    let best_category = mate_category(best.terminal_value());

    let candidates: Vec<&Node> = children
        .iter()
        .filter(|c| {
            c.tablebase_rank() == best_rank
                && mate_category(c.terminal_value()) == best_category
                && c.value_average() >= best_value - params.move_diversity_value_delta
        })
        .collect();
    if candidates.len() <= 1 {
        return best.mv();
    }

    let weights: Vec<f64> = candidates
        .iter()
        .map(|c| {
            (c.visit_count().max(0) as f64).powf(1.0 / params.move_diversity_temperature as f64)
        })
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return best.mv();
    }
    let mut sample = rng.gen_range(0.0..total);
    for (candidate, weight) in candidates.iter().zip(&weights) {
        if sample < *weight {
            return candidate.mv();
        }
        sample -= weight;
    }
    best.mv()
}

fn mate_category(terminal: TerminalValue) -> i8 {
    match terminal {
        TerminalValue::MateIn(_) => 1,
        TerminalValue::OpponentMateIn(_) => -1,
        _ => 0,
    }
}

// ============================================================================
// Post-hoc minimax (endgame)
// ============================================================================

/// In low-material endgames, averaged values blur short tactical truths;
/// re-minimax the visited tree and trust propagated extremes instead.
fn select_by_posthoc_minimax(params: &SearchParams, root: &Node, best_index: usize) -> EncodedMove {
    let children = root.children();
    let mut best: Option<(f32, i32, usize)> = None;
    for (index, child) in children.iter().enumerate() {
        let value = posthoc_minimax_value(params, child, root.visit_count());
        if value.is_nan() {
            continue;
        }
        let visits = child.visit_count();
        match best {
            Some((best_value, best_visits, _))
                if best_value > value || (best_value == value && best_visits >= visits) => {}
            _ => best = Some((value, visits, index)),
        }
    }
    children[best.map(|(_, _, index)| index).unwrap_or(best_index)].mv()
}

/// Minimax over already-visited subtrees, in the node's own perspective.
/// Returns NaN for subtrees too thin to trust.
fn posthoc_minimax_value(params: &SearchParams, node: &Node, parent_visits: i32) -> f32 {
    let visits = node.visit_count();
    if visits == 0 {
        return f32::NAN;
    }
    // Skip noise-level subtrees entirely.
    if (visits as f32) < params.minimax_visits_ignore * parent_visits as f32 {
        return f32::NAN;
    }
    let children = node.children();
    if children.is_empty() || visits < params.minimax_visits_recurse {
        return node.value_average();
    }

    let mut best_child_value = f32::NAN;
    for child in children {
        let value = posthoc_minimax_value(params, child, visits);
        if value.is_nan() {
            continue;
        }
        if best_child_value.is_nan() || value > best_child_value {
            best_child_value = value;
        }
    }
    if best_child_value.is_nan() {
        node.value_average()
    } else {
        // The side to move here picks the best child; this node's value
        // (for the player who moved into it) is the flip of that.
        flip_value(best_child_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PredictionCache;
    use crate::params::SearchParams;
    use engine_core::{ChessPosition, NullTablebase, VALUE_LOSS, VALUE_WIN};
    use rand::SeedableRng;
    use std::sync::atomic::AtomicBool;

    struct Fixture {
        params: SearchParams,
        cache: PredictionCache,
        tablebase: NullTablebase,
        pv_changed: AtomicBool,
        tb_hits: std::sync::atomic::AtomicU64,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                params: SearchParams::for_testing(),
                cache: PredictionCache::new(),
                tablebase: NullTablebase,
                pv_changed: AtomicBool::new(false),
                tb_hits: std::sync::atomic::AtomicU64::new(0),
            }
        }

        fn context(&self) -> SearchContext<'_> {
            SearchContext {
                params: &self.params,
                cache: &self.cache,
                tablebase: &self.tablebase,
                search_moves: &[],
                pv_changed: &self.pv_changed,
                tb_hits: &self.tb_hits,
            }
        }
    }

    fn expand(node: &Node, count: usize, fpu: f32) {
        assert!(node.try_begin_expansion());
        let children: Vec<Node> = (0..count)
            .map(|i| Node::new(EncodedMove(i as u16 + 1), 1.0 / count as f32, fpu))
            .collect();
        node.publish_children(children.into_boxed_slice());
    }

    fn path_through<'t>(nodes: &[&'t Node], weights: &[u8]) -> Vec<PathEntry<'t>> {
        nodes
            .iter()
            .zip(weights)
            .enumerate()
            .map(|(depth, (&node, &weight))| {
                node.begin_visit();
                PathEntry {
                    node,
                    index: if depth == 0 { usize::MAX } else { 0 },
                    weight,
                }
            })
            .collect()
    }

    #[test]
    fn test_backpropagate_flips_and_counts() {
        let params = SearchParams::for_testing();
        let root = Node::new_root(0.0);
        expand(&root, 2, 0.0);
        let child = &root.children()[0];
        expand(child, 2, 0.0);
        let leaf = &child.children()[0];

        let path = path_through(&[&root, child, leaf], &[1, 1, 1]);
        backpropagate(&params, &path, 0.8);

        assert_eq!(root.visit_count(), 1);
        assert_eq!(child.visit_count(), 1);
        assert_eq!(leaf.visit_count(), 1);
        assert_eq!(root.visiting_count(), 0);
        assert!((leaf.value_average() - 0.8).abs() < 1e-6);
        assert!((child.value_average() - 0.2).abs() < 1e-6);
        assert!((root.value_average() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_backpropagate_weight_zero_cuts_values() {
        let params = SearchParams::for_testing();
        let root = Node::new_root(0.0);
        expand(&root, 2, 0.0);
        let child = &root.children()[0];
        expand(child, 2, 0.0);
        let leaf = &child.children()[0];

        // The middle edge was a pure-exploration pick.
        let path = path_through(&[&root, child, leaf], &[1, 0, 1]);
        backpropagate(&params, &path, 0.9);

        // Visits land everywhere; values stop at the weight-0 level.
        assert_eq!(root.visit_count(), 1);
        assert_eq!(child.visit_count(), 1);
        assert_eq!(leaf.visit_count(), 1);
        assert!((leaf.value_average() - 0.9).abs() < 1e-6);
        assert_eq!(child.value_weight(), 0);
        assert_eq!(root.value_weight(), 0);
    }

    #[test]
    fn test_draw_sibling_fpu() {
        let mut params = SearchParams::for_testing();
        params.fpu_default = 0.25;
        let root = Node::new_root(0.0);
        root.sample_value(0.7, 1.0, 65536);
        expand(&root, 2, params.fpu_default);
        let child = &root.children()[0];
        expand(child, 3, params.fpu_default);
        let leaf = &child.children()[0];

        let path = path_through(&[&root, child, leaf], &[1, 1, 1]);
        backpropagate(&params, &path, VALUE_DRAW);

        // Leaf sampled the draw...
        assert!((leaf.value_average() - VALUE_DRAW).abs() < 1e-6);
        assert_eq!(leaf.value_weight(), 1);
        // ...its untouched siblings got re-seeded with the root value
        // (leaf depth 2: same perspective as the root)...
        for sibling in &child.children()[1..] {
            assert!((sibling.value_average() - 0.7).abs() < 1e-6);
            assert_eq!(sibling.value_weight(), 0);
        }
        // ...and the parent average was not dragged toward the draw.
        assert_eq!(child.value_weight(), 0);
        // The root keeps its pre-existing sample only.
        assert_eq!(root.value_weight(), 1);
    }

    #[test]
    fn test_bounded_value_clamps_during_backprop() {
        let params = SearchParams::for_testing();
        let root = Node::new_root(0.0);
        expand(&root, 2, 0.0);
        let child = &root.children()[0];
        child.set_tablebase_rank_bound(0, crate::node::Bound::Exact);

        let path = path_through(&[&root, child], &[1, 1]);
        backpropagate(&params, &path, 0.95);

        // The exact bound pins the child to a draw; the root sees the flip
        // of the clamped value, not of the raw one.
        assert!((child.value_average() - VALUE_DRAW).abs() < 1e-6);
        assert!((root.value_average() - VALUE_DRAW).abs() < 1e-6);
    }

    #[test]
    fn test_mate_backpropagation_two_levels() {
        let fixture = Fixture::new();
        let context = fixture.context();

        // root -> child -> leaf; leaf newly proven MateIn(1).
        let root = Node::new_root(0.0);
        expand(&root, 2, 0.0);
        let child = &root.children()[0];
        expand(child, 1, 0.0);
        let leaf = &child.children()[0];
        assert!(leaf.try_set_mate(1));

        let path = path_through(&[&root, child, leaf], &[1, 1, 1]);
        backpropagate(&context.params, &path, VALUE_LOSS);
        backpropagate_mate(&context, &path);

        // The child's only move walks into mate: child is lost, and since
        // it is the root's only proven-lost child the root stays open.
        assert_eq!(child.terminal_value(), TerminalValue::OpponentMateIn(1));
        assert_eq!(root.terminal_value(), TerminalValue::NonTerminal);
    }

    #[test]
    fn test_mate_backpropagation_full_sweep() {
        let fixture = Fixture::new();
        let context = fixture.context();

        let root = Node::new_root(0.0);
        expand(&root, 1, 0.0);
        let child = &root.children()[0];
        expand(child, 2, 0.0);
        // Both of the child's options are already proven mates for their
        // movers, one slower than the other.
        assert!(child.children()[1].try_set_mate(3));
        let leaf = &child.children()[0];
        assert!(leaf.try_set_mate(1));

        let path = path_through(&[&root, child, leaf], &[1, 1, 1]);
        backpropagate(&context.params, &path, VALUE_LOSS);
        backpropagate_mate(&context, &path);

        assert_eq!(child.terminal_value(), TerminalValue::OpponentMateIn(1));
        // The root's only child is a proven opponent mate, so the root's
        // mover mates in max(1) + 1.
        assert_eq!(root.terminal_value(), TerminalValue::MateIn(2));
    }

    #[test]
    fn test_update_pv_prefers_proven_mate_over_visits() {
        let fixture = Fixture::new();
        let context = fixture.context();

        let root = Node::new_root(0.0);
        expand(&root, 3, 0.0);
        let children = root.children();
        children[0].store_visit_count(100);
        children[2].store_visit_count(5);
        children[2].try_set_mate(2);

        // Path through the heavy child first establishes it as best.
        root.begin_visit();
        children[0].begin_visit();
        let path = vec![
            PathEntry {
                node: &root,
                index: usize::MAX,
                weight: 1,
            },
            PathEntry {
                node: &children[0],
                index: 0,
                weight: 1,
            },
        ];
        backpropagate(&context.params, &path, 0.6);
        update_principal_variation(&context, &path);
        assert_eq!(root.best_index(), Some(0));
        assert!(fixture.pv_changed.swap(false, Ordering::Acquire));

        // Now a path through the mating child takes over despite fewer
        // visits.
        root.begin_visit();
        children[2].begin_visit();
        let mate_path = vec![
            PathEntry {
                node: &root,
                index: usize::MAX,
                weight: 1,
            },
            PathEntry {
                node: &children[2],
                index: 2,
                weight: 1,
            },
        ];
        backpropagate(&context.params, &mate_path, VALUE_WIN);
        update_principal_variation(&context, &mate_path);
        assert_eq!(root.best_index(), Some(2));
        assert!(fixture.pv_changed.load(Ordering::Acquire));
    }

    #[test]
    fn test_fix_pv_rescans() {
        let fixture = Fixture::new();
        let context = fixture.context();

        let root = Node::new_root(0.0);
        expand(&root, 2, 0.0);
        root.store_best_index(0);
        root.children()[0].try_set_opponent_mate(2);
        root.children()[1].store_visit_count(1);

        fix_principal_variation(&context, &root);
        assert_eq!(root.best_index(), Some(1));
    }

    #[test]
    fn test_start_simulation_expands_root_and_yields() {
        let fixture = Fixture::new();
        let context = fixture.context();
        let tree = GameTree::new(ChessPosition::new(), fixture.params.fpu_root);
        let game = tree.shadow();
        let mut slot = SimulationSlot::new();
        let mut rng = ChaCha20Rng::seed_from_u64(7);

        let status = start_simulation(&context, &game, &mut slot, 0.0, &mut rng);
        assert_eq!(status, SimStatus::Yielded);
        assert_eq!(slot.phase, SlotPhase::WaitingForPrediction);
        assert_eq!(tree.root().visiting_count(), 1);

        let policy = PolicyLogits::default();
        resume_simulation(&context, &mut slot, &policy, 0.5, &mut rng);
        assert_eq!(slot.phase, SlotPhase::Working);
        assert!(tree.root().is_expanded());
        assert_eq!(tree.root().visit_count(), 1);
        assert_eq!(tree.root().visiting_count(), 0);
        assert_eq!(tree.root().children().len(), 20);
        // Root children carry the root FPU.
        for child in tree.root().children() {
            assert_eq!(child.value_average(), fixture.params.fpu_root);
        }
    }

    #[test]
    fn test_simulation_aborts_on_expansion_race() {
        let fixture = Fixture::new();
        let context = fixture.context();
        let tree = GameTree::new(ChessPosition::new(), 0.0);
        let game = tree.shadow();
        let mut rng = ChaCha20Rng::seed_from_u64(7);

        // Another worker owns the root expansion.
        assert!(tree.root().try_begin_expansion());

        let mut slot = SimulationSlot::new();
        let status = start_simulation(&context, &game, &mut slot, 0.0, &mut rng);
        assert_eq!(status, SimStatus::Aborted);
        assert_eq!(slot.failed_node_count, 1);
        assert_eq!(tree.root().visiting_count(), 0);
        assert_eq!(tree.root().visit_count(), 0);
    }

    #[test]
    fn test_select_move_fallbacks() {
        let fixture = Fixture::new();
        let context = fixture.context();
        let mut rng = ChaCha20Rng::seed_from_u64(7);

        // Unexpanded root: no move at all.
        let tree = GameTree::new(ChessPosition::new(), 0.0);
        assert!(select_move(&context, &tree, &mut rng).is_none());

        // Expanded but never backpropagated: highest prior wins.
        let tree = GameTree::new(ChessPosition::new(), 0.0);
        assert!(tree.root().try_begin_expansion());
        let moves = tree.position().legal_moves();
        let children: Vec<Node> = moves
            .iter()
            .enumerate()
            .map(|(i, m)| Node::new(EncodedMove::encode(m), if i == 7 { 0.5 } else { 0.02 }, 0.0))
            .collect();
        tree.root().publish_children(children.into_boxed_slice());
        let selected = select_move(&context, &tree, &mut rng).unwrap();
        assert_eq!(selected, EncodedMove::encode(&moves[7]));

        // With a best child recorded, it wins.
        tree.root().children()[3].store_visit_count(11);
        tree.root().store_best_index(3);
        let selected = select_move(&context, &tree, &mut rng).unwrap();
        assert_eq!(selected, EncodedMove::encode(&moves[3]));
    }

    #[test]
    fn test_posthoc_minimax_overrides_blurred_average() {
        let mut params = SearchParams::for_testing();
        params.minimax_visits_recurse = 10;
        params.minimax_visits_ignore = 0.0;

        let root = Node::new_root(0.0);
        root.store_visit_count(1000);
        expand(&root, 2, 0.0);
        let children = root.children();

        // Child 0: rosy average but its well-visited reply refutes it.
        children[0].store_visit_count(500);
        children[0].sample_value(0.9, 1.0, 65536);
        expand(&children[0], 1, 0.0);
        children[0].children()[0].store_visit_count(499);
        children[0].children()[0].sample_value(0.95, 1.0, 65536);

        // Child 1: modest but honest.
        children[1].store_visit_count(400);
        children[1].sample_value(0.6, 1.0, 65536);

        let selected = select_by_posthoc_minimax(&params, &root, 0);
        assert_eq!(selected, children[1].mv());
    }

    #[test]
    fn test_self_play_sampling_is_visit_weighted() {
        let fixture = Fixture::new();
        let mut params = fixture.params.clone();
        params.mode = SearchMode::SelfPlay;
        let context = SearchContext {
            params: &params,
            cache: &fixture.cache,
            tablebase: &fixture.tablebase,
            search_moves: &[],
            pv_changed: &fixture.pv_changed,
            tb_hits: &fixture.tb_hits,
        };
        let mut rng = ChaCha20Rng::seed_from_u64(42);

        let tree = GameTree::new(ChessPosition::new(), 0.0);
        assert!(tree.root().try_begin_expansion());
        let moves = tree.position().legal_moves();
        let children: Vec<Node> = moves
            .iter()
            .map(|m| Node::new(EncodedMove::encode(m), 0.05, 0.0))
            .collect();
        tree.root().publish_children(children.into_boxed_slice());
        tree.root().children()[0].store_visit_count(90);
        tree.root().children()[1].store_visit_count(10);
        tree.root().store_best_index(0);

        let mut counts = [0u32; 2];
        for _ in 0..200 {
            let mv = select_move(&context, &tree, &mut rng).unwrap();
            if mv == tree.root().children()[0].mv() {
                counts[0] += 1;
            } else if mv == tree.root().children()[1].mv() {
                counts[1] += 1;
            }
        }
        assert!(counts[0] > 150);
        assert!(counts[1] > 0);
        assert_eq!(counts[0] + counts[1], 200);
    }
}
