//! PUCT child selection.
//!
//! AZ-PUCT scores every child; a linear exploration bonus is layered on
//! top for the strongest few only. How many children count as "strongest"
//! shrinks exponentially as the search budget burns down, and with depth:
//! deep, rarely-visited parents get no breadth they haven't earned.

use crate::node::{Bound, Node, TerminalValue};
use crate::params::SearchParams;

/// Everything fixed for one selection step at one parent.
pub struct PuctContext<'a> {
    params: &'a SearchParams,
    children: &'a [Node],
    /// Parent visits including virtual exploration.
    parent_visits: f32,
    /// `(ln((N + base + 1)/base) + init) * sqrt(N)` — shared numerator of
    /// the exploration term.
    exploration_numerator: f32,
    /// How many children receive the linear exploration bonus.
    top_k: usize,
}

/// A chosen child plus its selective-backpropagation weight: weight 0
/// marks a pure-exploration pick whose value must not flow upward.
pub struct SelectedChild<'a> {
    pub index: usize,
    pub node: &'a Node,
    pub weight: u8,
}

impl<'a> PuctContext<'a> {
    /// `elimination_fraction` is the share of the node/time budget already
    /// consumed, on `[0, 1]`.
    pub fn new(
        params: &'a SearchParams,
        parent: &'a Node,
        root_visit_count: i32,
        elimination_fraction: f32,
    ) -> PuctContext<'a> {
        let children = parent.children();
        let parent_visits =
            (parent.visit_count() + parent.visiting_count()).max(1) as f32;

        let exploration_numerator = (((parent_visits + params.pb_c_base + 1.0)
            / params.pb_c_base)
            .ln()
            + params.pb_c_init)
            * parent_visits.sqrt();

        let base_exponent = params.elimination_base_exponent;
        let eliminated = (elimination_fraction.clamp(0.0, 1.0) * base_exponent as f32) as u32;
        let effective_exponent = base_exponent.saturating_sub(eliminated).max(1);

        let full_width = 1usize << base_exponent.min(16);
        let scaled = ((1u64 << effective_exponent.min(16)) as f32
            * root_visit_count.max(1) as f32
            / parent_visits) as usize;
        let top_k = children.len().min(full_width.min(scaled.max(1)));

        PuctContext {
            params,
            children,
            parent_visits,
            exploration_numerator,
            top_k,
        }
    }

    #[inline]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// AZ-PUCT for one child.
    pub fn az_puct(&self, child: &Node) -> f32 {
        let virtual_visits = (child.visit_count() + child.visiting_count()) as f32;
        let exploration = self.exploration_numerator / (virtual_visits + 1.0);

        let q = if child.bound() != Bound::None {
            child.bound().score()
        } else {
            let weight = child.value_weight().max(1) as f32;
            child.value_average() * weight
                / (weight
                    + child.visiting_count() as f32 * self.params.virtual_loss_coefficient)
        };

        let mate_term = match child.terminal_value() {
            TerminalValue::MateIn(n) => exploration * (-(n as f32)).exp2(),
            _ => 0.0,
        };

        q + exploration * child.prior() + mate_term
    }

    /// Linear exploration bonus applied to the top-K children only.
    #[inline]
    fn linear_bonus(&self, child: &Node) -> f32 {
        let virtual_visits = (child.visit_count() + child.visiting_count()) as f32;
        self.parent_visits
            / (self.params.linear_exploration_rate * virtual_visits
                + self.params.linear_exploration_delay)
    }

    /// Pick the child to descend into, or `None` when every child is
    /// blocked mid-expansion (the caller aborts the simulation).
    pub fn select_child(&self) -> Option<SelectedChild<'a>> {
        if self.children.is_empty() {
            return None;
        }

        let mut scores: Vec<(f32, usize)> = self
            .children
            .iter()
            .enumerate()
            .map(|(i, child)| (self.az_puct(child), i))
            .collect();

        let mut max_az = f32::NEG_INFINITY;
        for &(az, _) in &scores {
            max_az = max_az.max(az);
        }

        // Partial selection: everything before the pivot outranks it.
        let top_k = self.top_k.min(scores.len());
        if top_k < scores.len() {
            scores.select_nth_unstable_by(top_k - 1, |a, b| {
                b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let mut best: Option<(f32, f32, usize)> = None;
        for (rank, &(az, index)) in scores.iter().enumerate() {
            let child = &self.children[index];
            if child.expansion() == crate::node::Expansion::Expanding {
                continue;
            }
            let score = if rank < top_k {
                az + self.linear_bonus(child)
            } else {
                az
            };
            match best {
                Some((best_score, _, _)) if best_score >= score => {}
                _ => best = Some((score, az, index)),
            }
        }

        best.map(|(_, az, index)| {
            let weight =
                if az >= max_az - self.params.backpropagation_threshold {
                    1
                } else {
                    0
                };
            SelectedChild {
                index,
                node: &self.children[index],
                weight,
            }
        })
    }
}
