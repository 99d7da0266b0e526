//! Expression tree nodes and statement construction.

use crate::dialect::{AssignOp, BinaryOp, Operand, OperandKind, ScalarType, UnaryOp};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf(Operand),
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
}

impl Node {
    pub fn leaf(operand: Operand) -> Self {
        Node::Leaf(operand)
    }

    pub fn unary(op: UnaryOp, operand: Node) -> Self {
        Node::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Node, rhs: Node) -> Self {
        Node::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn scale(self, factor: Operand) -> Self {
        Node::binary(BinaryOp::Mult, self, Node::Leaf(factor))
    }

    pub fn element_prod(self, rhs: Node) -> Self {
        Node::binary(BinaryOp::ElementProd, self, rhs)
    }

    pub fn element_div(self, rhs: Node) -> Self {
        Node::binary(BinaryOp::ElementDiv, self, rhs)
    }

    pub fn element_max(self, rhs: Node) -> Self {
        Node::binary(BinaryOp::ElementMax, self, rhs)
    }

    pub fn element_min(self, rhs: Node) -> Self {
        Node::binary(BinaryOp::ElementMin, self, rhs)
    }

    pub fn trans(self) -> Self {
        Node::unary(UnaryOp::Trans, self)
    }

    pub fn inner_prod(lhs: Node, rhs: Node) -> Self {
        Node::binary(BinaryOp::InnerProd, lhs, rhs)
    }

    pub fn mat_vec_prod(matrix: Node, vector: Node) -> Self {
        Node::binary(BinaryOp::MatVecProd, matrix, vector)
    }

    /// Visits every operand below this node, left to right.
    pub fn for_each_operand<'a>(&'a self, f: &mut impl FnMut(&'a Operand)) {
        match self {
            Node::Leaf(operand) => f(operand),
            Node::Unary { operand, .. } => operand.for_each_operand(f),
            Node::Binary { lhs, rhs, .. } => {
                lhs.for_each_operand(f);
                rhs.for_each_operand(f);
            }
        }
    }

    pub fn contains_reduction(&self) -> bool {
        match self {
            Node::Leaf(_) => false,
            Node::Unary { operand, .. } => operand.contains_reduction(),
            Node::Binary { op, lhs, rhs } => {
                op.is_reduction() || lhs.contains_reduction() || rhs.contains_reduction()
            }
        }
    }
}

impl From<Operand> for Node {
    fn from(operand: Operand) -> Self {
        Node::Leaf(operand)
    }
}

impl std::ops::Add for Node {
    type Output = Node;

    fn add(self, rhs: Node) -> Node {
        Node::binary(BinaryOp::Add, self, rhs)
    }
}

impl std::ops::Sub for Node {
    type Output = Node;

    fn sub(self, rhs: Node) -> Node {
        Node::binary(BinaryOp::Sub, self, rhs)
    }
}

impl std::ops::Neg for Node {
    type Output = Node;

    fn neg(self) -> Node {
        Node::unary(UnaryOp::Neg, self)
    }
}

/// One assignment `target <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    target: Operand,
    assign: AssignOp,
    value: Node,
}

impl Statement {
    pub fn new(target: Operand, assign: AssignOp, value: impl Into<Node>) -> Result<Self> {
        let value = value.into();
        if let OperandKind::HostScalar(_) = target.kind {
            bail!("statement target {} is a host scalar and cannot be written", target.id);
        }

        let mut mismatched: Option<ScalarType> = None;
        value.for_each_operand(&mut |operand| {
            if operand.scalar_type != target.scalar_type {
                mismatched = Some(operand.scalar_type);
            }
        });
        if let Some(found) = mismatched {
            bail!(
                "statement mixes scalar types: target is {} but an operand is {}",
                target.scalar_type,
                found
            );
        }

        Ok(Self {
            target,
            assign,
            value,
        })
    }

    pub fn assign(target: Operand, value: impl Into<Node>) -> Result<Self> {
        Self::new(target, AssignOp::Assign, value)
    }

    pub fn inplace_add(target: Operand, value: impl Into<Node>) -> Result<Self> {
        Self::new(target, AssignOp::InplaceAdd, value)
    }

    pub fn inplace_sub(target: Operand, value: impl Into<Node>) -> Result<Self> {
        Self::new(target, AssignOp::InplaceSub, value)
    }

    pub fn target(&self) -> &Operand {
        &self.target
    }

    pub fn assign_op(&self) -> AssignOp {
        self.assign
    }

    pub fn value(&self) -> &Node {
        &self.value
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.target.scalar_type
    }

    /// All operands in visitation order, target first.
    pub fn operands(&self) -> Vec<&Operand> {
        let mut operands = vec![&self.target];
        self.value.for_each_operand(&mut |operand| operands.push(operand));
        operands
    }
}
