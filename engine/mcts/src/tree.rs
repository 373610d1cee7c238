//! Tree ownership and re-rooting.
//!
//! The parent owns its child array until pruned; a `GameTree` owns the
//! root and therefore, transitively, every node. Advancing the root keeps
//! the played move's subtree (moving it into a fresh root box) and drops
//! every sibling subtree post-order. All of this requires `&mut` — the
//! callers guarantee no search is in flight.

use engine_core::{ChessPosition, EncodedMove, Move, PositionError};

use crate::game::GameShadow;
use crate::node::Node;

/// A rooted search tree bound to the position its root represents.
pub struct GameTree {
    root: Box<Node>,
    position: ChessPosition,
}

impl GameTree {
    pub fn new(position: ChessPosition, root_fpu: f32) -> GameTree {
        GameTree {
            root: Box::new(Node::new_root(root_fpu)),
            position,
        }
    }

    #[inline]
    pub fn root(&self) -> &Node {
        &self.root
    }

    #[inline]
    pub fn position(&self) -> &ChessPosition {
        &self.position
    }

    /// A fresh descent view anchored at the current root.
    pub fn shadow(&self) -> GameShadow<'_> {
        GameShadow::new(&self.root, self.position.clone())
    }

    /// Replace everything with a new root position.
    pub fn reset(&mut self, position: ChessPosition, root_fpu: f32) {
        self.root = Box::new(Node::new_root(root_fpu));
        self.position = position;
    }

    /// Play `mv` at the root: the move's subtree (if grown) becomes the
    /// new tree and all siblings are pruned; otherwise the tree restarts
    /// from a bare root.
    pub fn advance(&mut self, mv: EncodedMove, root_fpu: f32) -> Result<Move, PositionError> {
        let played = self.position.apply_encoded(mv)?;
        if !self.reroot(mv) {
            self.root = Box::new(Node::new_root(root_fpu));
        }
        Ok(played)
    }

    fn reroot(&mut self, mv: EncodedMove) -> bool {
        let children = match self.root.take_children() {
            Some(children) => children,
            None => return false,
        };
        let mut children = children.into_vec();
        match children.iter().position(|child| child.mv() == mv) {
            Some(index) => {
                let kept = children.swap_remove(index);
                // Dropping the remainder prunes every sibling subtree.
                drop(children);
                self.root = Box::new(kept);
                true
            }
            None => false,
        }
    }

    /// The best-child chain from the root, for `info ... pv` lines.
    pub fn principal_variation(&self) -> Vec<EncodedMove> {
        let mut pv = Vec::new();
        let mut node = self.root.as_ref();
        while let Some(best) = node.best_child() {
            pv.push(best.mv());
            node = best;
        }
        pv
    }

    pub fn node_count(&self) -> usize {
        fn count(node: &Node) -> usize {
            1 + node.children().iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }

    /// Depth of the most-visited line; reported as `depth` over UCI.
    pub fn pv_depth(&self) -> u32 {
        self.principal_variation().len().max(1) as u32
    }
}

/// Debug-build invariant check: in a quiesced tree every `visiting_count`
/// is zero and a parent's visits exceed its children's sum by exactly the
/// simulation that expanded it (or by zero for a re-seeded root).
#[cfg(debug_assertions)]
pub fn validate_visit_accounting(node: &Node, is_search_root: bool) {
    assert_eq!(
        node.visiting_count(),
        0,
        "in-flight counts must unwind when search stops"
    );
    let children = node.children();
    if children.is_empty() {
        return;
    }
    let child_sum: i64 = children.iter().map(|c| c.visit_count() as i64).sum();
    let own = node.visit_count() as i64;
    if is_search_root {
        assert!(
            own == child_sum + 1 || own == child_sum,
            "root visits {} vs child sum {}",
            own,
            child_sum
        );
    } else {
        assert_eq!(own, child_sum + 1, "internal node visit accounting");
    }
    for child in children {
        validate_visit_accounting(child, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::MOVE_NONE;

    fn expand_with_moves(tree: &GameTree) {
        let node = tree.root();
        assert!(node.try_begin_expansion());
        let children: Vec<Node> = tree
            .position()
            .legal_moves()
            .iter()
            .map(|m| Node::new(EncodedMove::encode(m), 0.05, 0.0))
            .collect();
        node.publish_children(children.into_boxed_slice());
    }

    #[test]
    fn test_advance_reuses_subtree() {
        let mut tree = GameTree::new(ChessPosition::new(), 0.0);
        expand_with_moves(&tree);

        let e4 = EncodedMove::encode(&tree.position().parse_uci_move("e2e4").unwrap());
        let child = tree
            .root()
            .children()
            .iter()
            .find(|c| c.mv() == e4)
            .unwrap();
        child.begin_visit();
        child.complete_visit();
        child.sample_value(0.6, 1.0, 65536);

        tree.advance(e4, 0.0).unwrap();
        assert_eq!(tree.root().mv(), e4);
        assert_eq!(tree.root().visit_count(), 1);
        assert!((tree.root().value_average() - 0.6).abs() < 1e-6);
        assert_eq!(tree.position().ply(), 1);
    }

    #[test]
    fn test_advance_without_subtree_restarts() {
        let mut tree = GameTree::new(ChessPosition::new(), 0.0);
        let e4 = EncodedMove::encode(&tree.position().parse_uci_move("e2e4").unwrap());
        tree.advance(e4, 0.0).unwrap();
        assert_eq!(tree.root().mv(), MOVE_NONE);
        assert_eq!(tree.root().visit_count(), 0);
        assert_eq!(tree.position().ply(), 1);
    }

    #[test]
    fn test_advance_rejects_illegal_move() {
        let mut tree = GameTree::new(ChessPosition::new(), 0.0);
        assert!(tree.advance(EncodedMove(0x0FFF), 0.0).is_err());
        assert_eq!(tree.position().ply(), 0);
    }

    #[test]
    fn test_principal_variation_follows_best_children() {
        let tree = GameTree::new(ChessPosition::new(), 0.0);
        expand_with_moves(&tree);
        assert!(tree.principal_variation().is_empty());

        tree.root().store_best_index(3);
        let pv = tree.principal_variation();
        assert_eq!(pv.len(), 1);
        assert_eq!(pv[0], tree.root().children()[3].mv());
        assert_eq!(tree.pv_depth(), 1);
    }

    #[test]
    fn test_node_count() {
        let tree = GameTree::new(ChessPosition::new(), 0.0);
        assert_eq!(tree.node_count(), 1);
        expand_with_moves(&tree);
        assert_eq!(tree.node_count(), 21);
    }
}
