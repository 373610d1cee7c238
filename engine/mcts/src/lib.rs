//! Parallel Monte Carlo Tree Search with learned priors.
//!
//! The search core of the engine: a PUCT-driven tree search over atomic
//! nodes shared by a pool of worker threads, with leaf evaluations batched
//! through an external [`Evaluator`] and memoised in a lock-free
//! [`PredictionCache`].
//!
//! # Overview
//!
//! Each simulation:
//!
//! 1. **Selection**: descend from the root by AZ-PUCT with virtual loss,
//!    a linear exploration bonus for the strongest children, and an
//!    elimination schedule that narrows that set as the budget burns.
//! 2. **Expansion**: the first thread to reach an unexpanded leaf claims
//!    it by CAS, detects terminals and repetition draws, probes the
//!    prediction cache, and otherwise parks the leaf for the evaluator.
//! 3. **Evaluation**: parked leaves across a worker's slots go to the
//!    evaluator as one batch.
//! 4. **Backpropagation**: values flow leaf-to-root with selective
//!    weights; fresh mate proofs propagate exactly; best-child pointers
//!    maintain the principal variation as they go.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SearchController                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌──────────────┐  ┌─────────────────────┐ │
//! │  │  GameTree   │  │PredictionCache│ │      Evaluator      │ │
//! │  │(atomic nodes)│ │ (lock-free)  │  │  (batched network)  │ │
//! │  └──────┬──────┘  └──────┬───────┘  └──────────┬──────────┘ │
//! │         │                │                     │            │
//! │         ▼                ▼                     ▼            │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │   worker threads × slot simulations (virtual loss)    │  │
//! │  │        select → expand → evaluate → backpropagate     │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod controller;
pub mod evaluator;
pub mod game;
pub mod node;
pub mod params;
pub mod puct;
pub mod search;
pub mod tree;

// Re-export main types
pub use cache::{CacheError, CacheProbe, PredictionCache, MAX_CACHE_MOVES};
pub use controller::{ControllerError, SearchController, SelfPlayOutcome};
pub use evaluator::{
    EvaluationKind, Evaluator, EvaluatorError, PolicyLogits, PredictionStatus, UniformEvaluator,
};
pub use game::{GameShadow, SearchContext, SlotPhase};
pub use node::{Bound, Expansion, Node, TerminalValue};
pub use params::{SearchMode, SearchParams};
pub use puct::PuctContext;
pub use search::{select_move, SimStatus, SimulationSlot};
pub use tree::GameTree;
