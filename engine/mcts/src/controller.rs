//! The search controller: worker threads, leaf batching, stopping rules.
//!
//! A fixed pool of OS threads shares one tree and one prediction cache.
//! Each worker drives `parallelism` slot simulations as a cooperative
//! state machine, assembling the parked leaves into one evaluator batch
//! per pass. The primary worker (index 0) owns housekeeping: stop rules,
//! `info` emission, and the final `bestmove`. Workers block only on the
//! coordinator condvar when idle and inside `predict_batch`.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use engine_core::{
    value_to_centipawns, ChessPosition, Color, EncodedMove, InputPlanes, PositionError, Tablebase,
    TimeControl, VALUE_DRAW,
};
use engine_config::CentralConfig;

use crate::cache::{CacheError, PredictionCache};
use crate::evaluator::{EvaluationKind, Evaluator, PolicyLogits, PredictionStatus};
use crate::game::{SearchContext, SlotPhase};
use crate::node::TerminalValue;
use crate::params::{SearchMode, SearchParams};
use crate::search::{
    fail_simulation, resume_simulation, select_move, start_simulation, SimStatus, SimulationSlot,
};
use crate::tree::GameTree;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Position(#[from] PositionError),
}

/// Process-wide seed counter, mixed with wall time per worker so every
/// thread's stream differs even across rapid restarts.
static THREAD_SEED: AtomicU64 = AtomicU64::new(0);

fn worker_rng(seed_override: Option<u64>, worker_index: usize) -> ChaCha20Rng {
    let counter = THREAD_SEED.fetch_add(1, Ordering::Relaxed);
    let seed = match seed_override {
        Some(base) => base.wrapping_add(worker_index as u64),
        None => {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            nanos ^ counter.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        }
    };
    ChaCha20Rng::seed_from_u64(seed)
}

// ============================================================================
// Work coordination
// ============================================================================

struct CoordinatorState {
    generation: u64,
    searching: bool,
    active_workers: usize,
    quit: bool,
}

/// Condvar-based hand-off between the UCI thread and the worker pool.
struct WorkCoordinator {
    state: Mutex<CoordinatorState>,
    condvar: Condvar,
}

enum WorkItem {
    Search(u64),
    Quit,
}

impl WorkCoordinator {
    fn new() -> WorkCoordinator {
        WorkCoordinator {
            state: Mutex::new(CoordinatorState {
                generation: 0,
                searching: false,
                active_workers: 0,
                quit: false,
            }),
            condvar: Condvar::new(),
        }
    }

    fn begin_search(&self, worker_count: usize) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.searching = true;
        state.active_workers = worker_count;
        self.condvar.notify_all();
    }

    fn wait_for_work(&self, last_generation: u64) -> WorkItem {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.quit {
                return WorkItem::Quit;
            }
            if state.searching && state.generation != last_generation {
                return WorkItem::Search(state.generation);
            }
            state = self.condvar.wait(state).unwrap();
        }
    }

    /// Secondary workers call this when their search loop exits.
    fn worker_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.active_workers -= 1;
        self.condvar.notify_all();
    }

    /// The primary waits for every secondary before reporting.
    fn wait_for_secondaries(&self) {
        let mut state = self.state.lock().unwrap();
        while state.active_workers > 1 {
            state = self.condvar.wait(state).unwrap();
        }
    }

    /// The primary's final act: the search is over.
    fn search_complete(&self) {
        let mut state = self.state.lock().unwrap();
        state.active_workers = 0;
        state.searching = false;
        self.condvar.notify_all();
    }

    fn wait_until_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while state.searching {
            state = self.condvar.wait(state).unwrap();
        }
    }

    fn quit(&self) {
        let mut state = self.state.lock().unwrap();
        state.quit = true;
        self.condvar.notify_all();
    }
}

// ============================================================================
// Search request
// ============================================================================

/// A `go` command resolved into concrete limits.
#[derive(Clone)]
struct SearchRequest {
    started: Instant,
    infinite: bool,
    node_budget: Option<i64>,
    /// Wall-clock budget for this move, safety buffer already deducted.
    time_budget: Option<Duration>,
    mate_target: Option<u32>,
    depth_target: Option<u32>,
    search_moves: Vec<EncodedMove>,
    single_reply: bool,
}

impl SearchRequest {
    fn idle() -> SearchRequest {
        SearchRequest {
            started: Instant::now(),
            infinite: true,
            node_budget: None,
            time_budget: None,
            mate_target: None,
            depth_target: None,
            search_moves: Vec::new(),
            single_reply: false,
        }
    }

    /// Fraction of the node/time budget consumed, for PUCT elimination.
    fn elimination_fraction(&self, root_visits: i32) -> f32 {
        if let Some(budget) = self.node_budget {
            return (root_visits as f32 / budget.max(1) as f32).clamp(0.0, 1.0);
        }
        if let Some(budget) = self.time_budget {
            let budget_ms = budget.as_millis().max(1) as f32;
            return (self.started.elapsed().as_millis() as f32 / budget_ms).clamp(0.0, 1.0);
        }
        0.0
    }
}

struct Shared {
    config: CentralConfig,
    search_params: SearchParams,
    self_play_params: SearchParams,
    cache: PredictionCache,
    evaluator: Box<dyn Evaluator>,
    tablebase: Box<dyn Tablebase>,
    tree: RwLock<GameTree>,
    coordinator: WorkCoordinator,
    request: Mutex<SearchRequest>,

    stop: AtomicBool,
    pondering: AtomicBool,
    pv_changed: AtomicBool,
    tb_hits: AtomicU64,
    failed_nodes: AtomicU64,

    last_cache_flush: Mutex<Option<Instant>>,
    last_best_move: Mutex<Option<String>>,
    seed_override: Option<u64>,
}

// ============================================================================
// Controller
// ============================================================================

/// Owns the worker pool and the shared search state; the UCI front end
/// talks to this and nothing else.
pub struct SearchController {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    game_fen: String,
    game_moves: Vec<String>,
}

impl SearchController {
    pub fn new(
        config: CentralConfig,
        evaluator: Box<dyn Evaluator>,
        tablebase: Box<dyn Tablebase>,
    ) -> Result<SearchController, ControllerError> {
        Self::with_seed(config, evaluator, tablebase, None)
    }

    /// Deterministic construction for tests and reproductions: worker `i`
    /// seeds its RNG with `seed + i`.
    pub fn with_seed(
        config: CentralConfig,
        evaluator: Box<dyn Evaluator>,
        tablebase: Box<dyn Tablebase>,
        seed_override: Option<u64>,
    ) -> Result<SearchController, ControllerError> {
        let mut cache = PredictionCache::new();
        cache.allocate(config.cache.request_gib, config.cache.min_gib)?;

        let search_params = SearchParams::from_config(&config, SearchMode::Search);
        let self_play_params = SearchParams::from_config(&config, SearchMode::SelfPlay);
        let position = ChessPosition::new();
        let tree = GameTree::new(position, search_params.fpu_root);

        let shared = Arc::new(Shared {
            search_params,
            self_play_params,
            cache,
            evaluator,
            tablebase,
            tree: RwLock::new(tree),
            coordinator: WorkCoordinator::new(),
            request: Mutex::new(SearchRequest::idle()),
            stop: AtomicBool::new(false),
            pondering: AtomicBool::new(false),
            pv_changed: AtomicBool::new(false),
            tb_hits: AtomicU64::new(0),
            failed_nodes: AtomicU64::new(0),
            last_cache_flush: Mutex::new(None),
            last_best_move: Mutex::new(None),
            seed_override,
            config,
        });

        let worker_count = shared.config.workers.thread_count.max(1);
        let workers = (0..worker_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("search-{index}"))
                    .spawn(move || worker_loop(shared, index))
                    .expect("spawn search worker")
            })
            .collect();

        Ok(SearchController {
            shared,
            workers,
            game_fen: ChessPosition::new().fen(),
            game_moves: Vec::new(),
        })
    }

    /// Block until the worker pool is idle and responsive.
    pub fn wait_until_ready(&self) {
        self.shared.coordinator.wait_until_idle();
    }

    /// `position ...`: either extend the live tree by the new tail moves,
    /// reusing the matching subtrees, or start from scratch.
    pub fn update_position(
        &mut self,
        fen: &str,
        moves: &[String],
        force_new: bool,
    ) -> Result<(), ControllerError> {
        self.stop_and_wait();

        let reusable = !force_new
            && fen == self.game_fen
            && moves.len() >= self.game_moves.len()
            && moves[..self.game_moves.len()] == self.game_moves[..];

        let mut tree = self.shared.tree.write().unwrap();
        let root_fpu = self.shared.search_params.fpu_root;
        if reusable {
            for token in &moves[self.game_moves.len()..] {
                let m = tree
                    .position()
                    .parse_uci_move(token)
                    .ok_or_else(|| PositionError::IllegalMove(token.clone()))?;
                tree.advance(EncodedMove::encode(&m), root_fpu)?;
            }
            debug!(tail = moves.len() - self.game_moves.len(), "position extended");
        } else {
            let mut position = ChessPosition::from_fen(fen)?;
            for token in moves {
                let m = position
                    .parse_uci_move(token)
                    .ok_or_else(|| PositionError::IllegalMove(token.clone()))?;
                position.apply_move(&m);
            }
            tree.reset(position, root_fpu);
            debug!(fen = %fen, moves = moves.len(), "position reset");
        }

        self.game_fen = fen.to_string();
        self.game_moves = moves.to_vec();
        Ok(())
    }

    /// `go`: resolve the time control and wake the workers.
    pub fn go(&self, time_control: &TimeControl) {
        self.shared.coordinator.wait_until_idle();

        let request = {
            let tree = self.shared.tree.read().unwrap();
            self.resolve_request(time_control, tree.position())
        };

        self.shared.stop.store(false, Ordering::Release);
        self.shared
            .pondering
            .store(time_control.ponder, Ordering::Release);
        self.shared.pv_changed.store(false, Ordering::Release);
        self.shared.tb_hits.store(0, Ordering::Relaxed);
        self.shared.failed_nodes.store(0, Ordering::Relaxed);
        self.shared.cache.reset_probe_metrics();
        *self.shared.request.lock().unwrap() = request;

        self.shared
            .coordinator
            .begin_search(self.shared.config.workers.thread_count.max(1));
    }

    fn resolve_request(&self, tc: &TimeControl, position: &ChessPosition) -> SearchRequest {
        let time_config = &self.shared.config.time;
        let side = if position.side_to_move() == Color::White {
            0
        } else {
            1
        };

        let mut time_budget = None;
        if tc.move_time_ms > 0 {
            time_budget = Some(Duration::from_millis(
                tc.move_time_ms
                    .saturating_sub(time_config.safety_buffer_ms)
                    .max(1),
            ));
        } else if tc.time_remaining_ms[side] > 0 {
            let divisor = if tc.moves_to_go > 0 {
                (tc.moves_to_go as u64).min(time_config.fraction_of_remaining)
            } else {
                time_config.fraction_of_remaining
            };
            let base = tc.time_remaining_ms[side] / divisor.max(1);
            let increment =
                (tc.increment_ms[side] as f64 * time_config.increment_fraction) as u64;
            let budget = (base + increment)
                .max(time_config.minimum_move_time_ms)
                .saturating_sub(time_config.safety_buffer_ms)
                .max(1)
                .min(tc.time_remaining_ms[side].saturating_sub(time_config.safety_buffer_ms).max(1));
            time_budget = Some(Duration::from_millis(budget));
        }

        SearchRequest {
            started: Instant::now(),
            infinite: tc.infinite,
            node_budget: (tc.nodes > 0).then_some(tc.nodes as i64),
            time_budget,
            mate_target: (tc.mate > 0).then_some(tc.mate),
            depth_target: (tc.depth > 0).then_some(tc.depth),
            search_moves: tc.search_moves.clone(),
            single_reply: position.legal_moves().len() == 1,
        }
    }

    /// `stop`: the workers finish in-flight work, the primary reports.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    fn stop_and_wait(&self) {
        self.stop();
        self.shared.coordinator.wait_until_idle();
    }

    /// `ponderhit`: the pondered move was played; convert to a normal
    /// search timed from the original start.
    pub fn ponder_hit(&self) {
        self.shared.pondering.store(false, Ordering::Release);
    }

    /// Last `bestmove` emitted, for callers that don't scrape stdout.
    pub fn last_best_move(&self) -> Option<String> {
        self.shared.last_best_move.lock().unwrap().clone()
    }

    /// Read-only access to the live tree (diagnostics and tests).
    pub fn with_tree<R>(&self, f: impl FnOnce(&GameTree) -> R) -> R {
        let tree = self.shared.tree.read().unwrap();
        f(&tree)
    }

    pub fn cache_permille_full(&self) -> u32 {
        self.shared.cache.permille_full()
    }

    pub fn cache_permille_hits(&self) -> u32 {
        self.shared.cache.permille_hits()
    }

    /// Play complete self-play games on the calling thread, batching leaf
    /// evaluations across `parallelism` concurrent games.
    pub fn play_self_play_games(&self, games: u32) -> Vec<SelfPlayOutcome> {
        self.shared.coordinator.wait_until_idle();
        run_self_play(&self.shared, games)
    }
}

impl Drop for SearchController {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.coordinator.quit();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

// ============================================================================
// Worker loop
// ============================================================================

fn worker_loop(shared: Arc<Shared>, worker_index: usize) {
    let mut last_generation = 0;
    loop {
        match shared.coordinator.wait_for_work(last_generation) {
            WorkItem::Quit => return,
            WorkItem::Search(generation) => {
                last_generation = generation;
                run_search(&shared, worker_index);
                if worker_index == 0 {
                    shared.coordinator.wait_for_secondaries();
                    report_best_move(&shared);
                    shared.coordinator.search_complete();
                } else {
                    shared.coordinator.worker_done();
                }
            }
        }
    }
}

struct BatchBuffers {
    images: Vec<InputPlanes>,
    values: Vec<f32>,
    policies: Vec<PolicyLogits>,
    slots: Vec<usize>,
}

impl BatchBuffers {
    fn new(capacity: usize) -> BatchBuffers {
        BatchBuffers {
            images: Vec::with_capacity(capacity),
            values: vec![0.0; capacity],
            policies: vec![PolicyLogits::default(); capacity],
            slots: Vec::with_capacity(capacity),
        }
    }
}

fn run_search(shared: &Shared, worker_index: usize) {
    let request = shared.request.lock().unwrap().clone();
    let params = &shared.search_params;
    let workers_config = &shared.config.workers;
    let mut rng = worker_rng(shared.seed_override, worker_index);

    let tree = shared.tree.read().unwrap();
    let context = SearchContext {
        params,
        cache: &shared.cache,
        tablebase: shared.tablebase.as_ref(),
        search_moves: &request.search_moves,
        pv_changed: &shared.pv_changed,
        tb_hits: &shared.tb_hits,
    };
    let game = tree.shadow();
    let root = tree.root();

    let parallelism = workers_config.parallelism.max(1);
    let mut slots: Vec<SimulationSlot> = (0..parallelism).map(|_| SimulationSlot::new()).collect();
    let mut batch = BatchBuffers::new(parallelism);
    let mut housekeeping = Housekeeping::new(shared, &request);

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        // Slow start: while the root neighbourhood is thin, fewer threads
        // and narrower batches avoid piling virtual loss onto one line.
        let root_visits = root.visit_count();
        let slow = root_visits < workers_config.slowstart_nodes;
        if slow && worker_index >= workers_config.slowstart_threads.max(1) {
            std::thread::yield_now();
            continue;
        }
        let active = if slow {
            workers_config.slowstart_parallelism.clamp(1, parallelism)
        } else {
            parallelism
        };

        if worker_index == 0 {
            housekeeping.run(shared, &tree, &request);
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
        }

        // Fill each working slot until it parks a leaf (or the budget is
        // gone). The iteration cap keeps cache-fed bursts from starving
        // the stop checks.
        let fraction = request.elimination_fraction(root.visit_count());
        for slot in slots.iter_mut().take(active) {
            if slot.phase != SlotPhase::Working {
                continue;
            }
            for _ in 0..16 {
                if shared.stop.load(Ordering::Acquire) || budget_spent(&request, root.visit_count())
                {
                    break;
                }
                match start_simulation(&context, &game, slot, fraction, &mut rng) {
                    SimStatus::Yielded => break,
                    SimStatus::Completed | SimStatus::Aborted => continue,
                }
            }
        }

        // Assemble the parked leaves into one evaluator batch.
        batch.images.clear();
        batch.slots.clear();
        for (index, slot) in slots.iter().enumerate().take(active) {
            if slot.phase == SlotPhase::WaitingForPrediction {
                batch.images.push(slot.image);
                batch.slots.push(index);
            }
        }
        if batch.slots.is_empty() {
            // Nothing to evaluate (all terminal or budget spent); let the
            // stop checks catch up.
            std::thread::yield_now();
            continue;
        }

        let count = batch.slots.len();
        let status = shared.evaluator.predict_batch(
            EvaluationKind::Search,
            &batch.images,
            &mut batch.values[..count],
            &mut batch.policies[..count],
        );
        match status {
            Ok(status) => {
                if status.contains(PredictionStatus::UPDATED_NETWORK) {
                    maybe_flush_cache(shared);
                }
            }
            Err(error) => {
                warn!(%error, "evaluator batch failed; aborting parked simulations");
                for &slot_index in &batch.slots {
                    let slot = &mut slots[slot_index];
                    if let Some(shadow) = &slot.shadow {
                        shadow.node().cancel_expansion();
                    }
                    fail_simulation(slot);
                }
                continue;
            }
        }

        for (batch_index, &slot_index) in batch.slots.iter().enumerate() {
            resume_simulation(
                &context,
                &mut slots[slot_index],
                &batch.policies[batch_index],
                batch.values[batch_index],
                &mut rng,
            );
        }
    }

    // Finalize: unwind in-flight virtual loss and roll back claimed
    // expansions so the tree is consistent for the next search.
    for slot in &mut slots {
        if slot.phase == SlotPhase::WaitingForPrediction {
            if let Some(shadow) = &slot.shadow {
                shadow.node().cancel_expansion();
            }
            fail_simulation(slot);
        }
        shared
            .failed_nodes
            .fetch_add(slot.failed_node_count, Ordering::Relaxed);
    }
}

fn budget_spent(request: &SearchRequest, root_visits: i32) -> bool {
    matches!(request.node_budget, Some(budget) if (root_visits as i64) >= budget)
}

/// The cache flush a network update asks for, throttled globally so a
/// rapidly retraining evaluator can't wipe the cache every batch.
fn maybe_flush_cache(shared: &Shared) {
    let throttle = Duration::from_secs(shared.config.cache.network_flush_throttle_secs);
    let mut last_flush = shared.last_cache_flush.lock().unwrap();
    let due = match *last_flush {
        None => true,
        Some(at) => at.elapsed() >= throttle,
    };
    if due {
        info!("network updated; clearing prediction cache");
        shared.cache.clear();
        *last_flush = Some(Instant::now());
    }
}

// ============================================================================
// Housekeeping (primary worker)
// ============================================================================

struct Housekeeping {
    last_info: Instant,
    pv_interval: Duration,
    mate_stop: Duration,
}

impl Housekeeping {
    fn new(shared: &Shared, _request: &SearchRequest) -> Housekeeping {
        Housekeeping {
            last_info: Instant::now(),
            pv_interval: Duration::from_millis(shared.config.logging.pv_interval_ms),
            mate_stop: Duration::from_secs(shared.search_params.mate_stop_seconds),
        }
    }

    fn run(&mut self, shared: &Shared, tree: &GameTree, request: &SearchRequest) {
        let elapsed = request.started.elapsed();
        let root = tree.root();
        let root_visits = root.visit_count();
        let pondering = shared.pondering.load(Ordering::Acquire);

        let best_mate = root.best_child().map(|c| c.terminal_value());
        let proven_mate = matches!(best_mate, Some(TerminalValue::MateIn(_)));

        let mut should_stop = false;
        if !request.infinite && !pondering {
            if budget_spent(request, root_visits) {
                should_stop = true;
            }
            if let Some(budget) = request.time_budget {
                if elapsed >= budget {
                    should_stop = true;
                }
            }
            if let Some(depth) = request.depth_target {
                if tree.pv_depth() >= depth {
                    should_stop = true;
                }
            }
            if let Some(mate_in) = request.mate_target {
                if matches!(best_mate, Some(TerminalValue::MateIn(n)) if (n as u32) <= mate_in) {
                    should_stop = true;
                }
            }
            if request.single_reply && root_visits > 0 {
                should_stop = true;
            }
            if proven_mate && elapsed >= self.mate_stop {
                should_stop = true;
            }
        }
        if should_stop {
            shared.stop.store(true, Ordering::Release);
        }

        let pv_dirty = shared.pv_changed.swap(false, Ordering::Acquire);
        if pv_dirty || self.last_info.elapsed() >= self.pv_interval {
            self.last_info = Instant::now();
            emit_info(shared, tree, request);
        }
    }
}

fn emit_info(shared: &Shared, tree: &GameTree, request: &SearchRequest) {
    let root = tree.root();
    let elapsed_ms = request.started.elapsed().as_millis().max(1) as u64;
    let nodes = root.visit_count().max(0) as u64;
    let nps = nodes * 1000 / elapsed_ms;

    let score = match root.best_child() {
        Some(best) => match best.terminal_value() {
            TerminalValue::MateIn(n) => format!("mate {n}"),
            TerminalValue::OpponentMateIn(n) => format!("mate -{n}"),
            _ => format!("cp {}", value_to_centipawns(best.value_average())),
        },
        None => format!("cp {}", value_to_centipawns(VALUE_DRAW)),
    };

    let mut pv = String::new();
    let mut position = tree.position().clone();
    for encoded in tree.principal_variation() {
        match position.apply_encoded(encoded) {
            Ok(m) => {
                pv.push(' ');
                pv.push_str(&ChessPosition::move_to_uci(&m));
            }
            Err(_) => break,
        }
    }
    if pv.is_empty() {
        return;
    }

    let line = format!(
        "info depth {} score {} nodes {} nps {} tbhits {} time {} hashfull {} pv{}",
        tree.pv_depth(),
        score,
        nodes,
        nps,
        shared.tb_hits.load(Ordering::Relaxed),
        elapsed_ms,
        shared.cache.permille_full(),
        pv,
    );
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

fn report_best_move(shared: &Shared) {
    let tree = shared.tree.read().unwrap();
    let request = shared.request.lock().unwrap().clone();

    // Every worker has unwound by now; the tree must balance.
    #[cfg(debug_assertions)]
    crate::tree::validate_visit_accounting(tree.root(), true);
    let mut rng = worker_rng(shared.seed_override, 0);

    let context = SearchContext {
        params: &shared.search_params,
        cache: &shared.cache,
        tablebase: shared.tablebase.as_ref(),
        search_moves: &request.search_moves,
        pv_changed: &shared.pv_changed,
        tb_hits: &shared.tb_hits,
    };

    emit_info(shared, &tree, &request);

    let best = select_move(&context, &tree, &mut rng)
        .and_then(|encoded| {
            let mut position = tree.position().clone();
            position.apply_encoded(encoded).ok()
        })
        .map(|m| ChessPosition::move_to_uci(&m))
        .unwrap_or_else(|| "0000".to_string());

    debug!(
        best = %best,
        nodes = tree.root().visit_count(),
        failed = shared.failed_nodes.load(Ordering::Relaxed),
        cache_hits_permille = shared.cache.permille_hits(),
        "search finished"
    );

    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "bestmove {best}");
    let _ = stdout.flush();
    *shared.last_best_move.lock().unwrap() = Some(best);
}

// ============================================================================
// Self-play
// ============================================================================

/// Result of one completed self-play game.
#[derive(Debug, Clone)]
pub struct SelfPlayOutcome {
    pub plies: u32,
    /// Final value from the first player's perspective.
    pub result: f32,
}

const MAX_SELF_PLAY_PLIES: u32 = 512;

/// Drive `games` self-play games to completion, each slot owning its own
/// tree, batching parked leaves across slots exactly like the search
/// workers do.
fn run_self_play(shared: &Shared, games: u32) -> Vec<SelfPlayOutcome> {
    let params = &shared.self_play_params;
    let mut rng = worker_rng(shared.seed_override, usize::MAX / 2);
    let mut outcomes = Vec::with_capacity(games as usize);

    let slot_count = (shared.config.workers.parallelism.max(1) as u32).min(games) as usize;
    let mut trees: Vec<GameTree> = (0..slot_count)
        .map(|_| GameTree::new(ChessPosition::new(), params.fpu_root))
        .collect();
    let mut batch = BatchBuffers::new(slot_count.max(1));

    // Slots are rebuilt every pass because playing a move re-roots its
    // tree and invalidates borrows; the parked-leaf state machine
    // therefore lives within a single pass here, trading some batching
    // efficiency for a much simpler ownership story.
    while outcomes.len() < games as usize {
        let mut progressed = false;
        for tree in trees.iter_mut() {
            if outcomes.len() >= games as usize {
                break;
            }

            let finished = {
                let context = SearchContext {
                    params,
                    cache: &shared.cache,
                    tablebase: shared.tablebase.as_ref(),
                    search_moves: &[],
                    pv_changed: &shared.pv_changed,
                    tb_hits: &shared.tb_hits,
                };
                let game_over = play_one_move(&context, tree, &mut batch, shared, &mut rng);
                progressed = true;
                game_over
            };

            if let Some(outcome) = finished {
                outcomes.push(outcome);
                tree.reset(ChessPosition::new(), params.fpu_root);
            }
        }
        if !progressed {
            break;
        }
    }

    outcomes
}

/// Run one move's worth of simulations on this game and play the chosen
/// move; returns the outcome if the game ended.
fn play_one_move(
    context: &SearchContext<'_>,
    tree: &mut GameTree,
    batch: &mut BatchBuffers,
    shared: &Shared,
    rng: &mut ChaCha20Rng,
) -> Option<SelfPlayOutcome> {
    let params = context.params;

    // Terminal and over-long games end before searching. The position is
    // consulted directly: the root node may be freshly re-rooted and not
    // yet carry the proof the board state implies.
    let ply = tree.position().ply();
    let terminal = if tree.root().terminal_value().is_terminal() {
        tree.root().terminal_value()
    } else if tree.position().legal_moves().is_empty() {
        if tree.position().in_check() {
            TerminalValue::MateIn(1)
        } else {
            TerminalValue::Draw
        }
    } else if tree.position().repetition_distance() < 0
        || tree.position().halfmove_clock() > 99
        || ply >= MAX_SELF_PLAY_PLIES
    {
        TerminalValue::Draw
    } else {
        TerminalValue::NonTerminal
    };
    if terminal.is_terminal() {
        return Some(SelfPlayOutcome {
            plies: ply,
            result: terminal_result_for_first_player(terminal, ply),
        });
    }

    {
        let game = tree.shadow();
        let mut slot = SimulationSlot::new();
        let budget = params.simulations_per_move as i32;

        while tree.root().visit_count() < budget {
            let fraction =
                (tree.root().visit_count() as f32 / budget.max(1) as f32).clamp(0.0, 1.0);
            match start_simulation(context, &game, &mut slot, fraction, rng) {
                SimStatus::Yielded => {
                    batch.images.clear();
                    batch.images.push(slot.image);
                    let status = shared.evaluator.predict_batch(
                        EvaluationKind::SelfPlay,
                        &batch.images,
                        &mut batch.values[..1],
                        &mut batch.policies[..1],
                    );
                    match status {
                        Ok(status) => {
                            if status.contains(PredictionStatus::UPDATED_NETWORK) {
                                maybe_flush_cache(shared);
                            }
                            resume_simulation(
                                context,
                                &mut slot,
                                &batch.policies[0],
                                batch.values[0],
                                rng,
                            );
                        }
                        Err(error) => {
                            warn!(%error, "self-play evaluation failed; abandoning simulation");
                            if let Some(shadow) = &slot.shadow {
                                shadow.node().cancel_expansion();
                            }
                            fail_simulation(&mut slot);
                        }
                    }
                }
                SimStatus::Completed | SimStatus::Aborted => {}
            }
            // A terminal root makes no progress by simulating.
            if tree.root().terminal_value().is_terminal() {
                break;
            }
        }
    }

    let selected = {
        let mut selection_rng = ChaCha20Rng::seed_from_u64(rng.next_u64());
        select_move(context, tree, &mut selection_rng)
    };
    match selected {
        Some(encoded) => {
            if let Err(error) = tree.advance(encoded, params.fpu_root) {
                warn!(%error, "self-play move failed to apply; scoring as a draw");
                return Some(SelfPlayOutcome {
                    plies: tree.position().ply(),
                    result: VALUE_DRAW,
                });
            }
            None
        }
        None => {
            let terminal = tree.root().terminal_value();
            let ply = tree.position().ply();
            Some(SelfPlayOutcome {
                plies: ply,
                result: terminal_result_for_first_player(terminal, ply),
            })
        }
    }
}

/// Express a terminal value (perspective of the mover into the final
/// position) as a result for the player who moved first.
fn terminal_result_for_first_player(terminal: TerminalValue, ply: u32) -> f32 {
    let value = terminal.node_value();
    // The mover into the final position played on ply `ply - 1`.
    if ply == 0 {
        VALUE_DRAW
    } else {
        engine_core::flip_value_across(ply - 1, value)
    }
}
