//! Evaluator trait for batched position evaluation.
//!
//! The evaluator provides policy logits and a value estimate for a batch of
//! positions. In production this is a neural network on an accelerator; the
//! search core only sees this trait. For testing we provide a uniform
//! evaluator that returns flat logits.

use engine_core::{InputPlanes, POLICY_SIZE, VALUE_DRAW};
use thiserror::Error;

/// Errors that can occur during evaluation.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("Evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("Batch shape mismatch: {0}")]
    BatchMismatch(String),
}

/// Raw policy logits for one position, indexed by
/// `engine_core::policy_index`.
#[derive(Clone)]
pub struct PolicyLogits {
    pub logits: [f32; POLICY_SIZE],
}

impl Default for PolicyLogits {
    fn default() -> Self {
        PolicyLogits {
            logits: [0.0; POLICY_SIZE],
        }
    }
}

/// Which consumer is asking; an implementation may serve different networks
/// for tournament search and self-play data generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationKind {
    Search,
    SelfPlay,
}

/// Bitmask returned by `predict_batch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionStatus(pub u32);

impl PredictionStatus {
    /// The serving network changed since the previous batch; cached
    /// predictions are stale.
    pub const UPDATED_NETWORK: PredictionStatus = PredictionStatus(1);

    #[inline]
    pub fn contains(self, flag: PredictionStatus) -> bool {
        self.0 & flag.0 != 0
    }

    #[inline]
    pub fn union(self, other: PredictionStatus) -> PredictionStatus {
        PredictionStatus(self.0 | other.0)
    }
}

/// Batched evaluator; values come back from the perspective of each
/// position's side to move, on `[0, 1]`.
pub trait Evaluator: Send + Sync {
    fn predict_batch(
        &self,
        kind: EvaluationKind,
        images: &[InputPlanes],
        values: &mut [f32],
        policies: &mut [PolicyLogits],
    ) -> Result<PredictionStatus, EvaluatorError>;
}

/// Evaluator stand-in returning a constant value and flat logits, which
/// softmax into a uniform policy over legal moves.
#[derive(Debug, Clone)]
pub struct UniformEvaluator {
    value: f32,
}

impl UniformEvaluator {
    pub fn new() -> Self {
        Self { value: VALUE_DRAW }
    }

    pub fn with_value(value: f32) -> Self {
        Self { value }
    }
}

impl Default for UniformEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator for UniformEvaluator {
    fn predict_batch(
        &self,
        _kind: EvaluationKind,
        images: &[InputPlanes],
        values: &mut [f32],
        policies: &mut [PolicyLogits],
    ) -> Result<PredictionStatus, EvaluatorError> {
        if images.len() != values.len() || images.len() != policies.len() {
            return Err(EvaluatorError::BatchMismatch(format!(
                "images={} values={} policies={}",
                images.len(),
                values.len(),
                policies.len()
            )));
        }
        for value in values.iter_mut() {
            *value = self.value;
        }
        for policy in policies.iter_mut() {
            policy.logits.fill(0.0);
        }
        Ok(PredictionStatus::default())
    }
}
