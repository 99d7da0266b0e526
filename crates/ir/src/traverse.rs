//! Depth-first statement traversal.
//!
//! Every consumer that assigns or looks up argument slots walks statements through
//! [`traverse`], so leaf ordinals are identical between source generation and
//! argument binding.

use crate::builder::{Node, Statement};
use crate::dialect::Operand;

/// A leaf operand together with its position in visitation order.
#[derive(Debug, Clone, Copy)]
pub struct LeafRef<'a> {
    pub ordinal: usize,
    pub operand: &'a Operand,
    /// True for the statement target.
    pub is_target: bool,
}

pub trait Visitor {
    fn leaf(&mut self, leaf: LeafRef<'_>);

    fn enter(&mut self, _node: &Node) {}

    /// Called between the two children of a binary node.
    fn infix(&mut self, _node: &Node) {}

    fn leave(&mut self, _node: &Node) {}
}

/// Walks the target, then the value tree left to right.
pub fn traverse<V: Visitor + ?Sized>(statement: &Statement, visitor: &mut V) {
    let mut ordinal = 0;
    visitor.leaf(LeafRef {
        ordinal,
        operand: statement.target(),
        is_target: true,
    });
    ordinal += 1;
    walk(statement.value(), visitor, &mut ordinal);
}

fn walk<V: Visitor + ?Sized>(node: &Node, visitor: &mut V, ordinal: &mut usize) {
    match node {
        Node::Leaf(operand) => {
            visitor.leaf(LeafRef {
                ordinal: *ordinal,
                operand,
                is_target: false,
            });
            *ordinal += 1;
        }
        Node::Unary { operand, .. } => {
            visitor.enter(node);
            walk(operand, visitor, ordinal);
            visitor.leave(node);
        }
        Node::Binary { lhs, rhs, .. } => {
            visitor.enter(node);
            walk(lhs, visitor, ordinal);
            visitor.infix(node);
            walk(rhs, visitor, ordinal);
            visitor.leave(node);
        }
    }
}

/// Number of leaves [`traverse`] reports for a statement.
pub fn leaf_count(statement: &Statement) -> usize {
    struct Counter(usize);
    impl Visitor for Counter {
        fn leaf(&mut self, _leaf: LeafRef<'_>) {
            self.0 += 1;
        }
    }
    let mut counter = Counter(0);
    traverse(statement, &mut counter);
    counter.0
}
