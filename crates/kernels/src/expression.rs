//! WGSL rendering of statement expression trees.

use crate::mapping::{Access, Mapping};
use kerneltune_ir::{traverse, AssignOp, BinaryOp, LeafRef, Node, Statement, UnaryOp, Visitor};

/// Placeholder a rendered reduction node evaluates to.
pub const REDUCTION_RESULT: &str = "acc";

/// A statement rendered against one mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedStatement {
    pub target: String,
    pub assign: AssignOp,
    pub value: String,
    /// Operand expressions of the reduction node, if the tree has one.
    pub reduction: Option<(String, String)>,
}

impl RenderedStatement {
    pub fn assignment(&self) -> String {
        format!("{} {} {};", self.target, self.assign.token(), self.value)
    }

    /// Assignment of `value` in place of the rendered right-hand side.
    pub fn assignment_of(&self, value: &str) -> String {
        format!("{} {} {};", self.target, self.assign.token(), value)
    }
}

struct Renderer<'m> {
    mapping: &'m Mapping,
    target_access: &'m Access,
    value_access: &'m Access,
    transposed: bool,
    frames: Vec<Vec<String>>,
    target: String,
    value: String,
    reduction: Option<(String, String)>,
}

impl Renderer<'_> {
    fn emit(&mut self, text: String) {
        match self.frames.last_mut() {
            Some(frame) => frame.push(text),
            None => self.value = text,
        }
    }
}

impl Visitor for Renderer<'_> {
    fn leaf(&mut self, leaf: LeafRef<'_>) {
        let object = &self.mapping[leaf.ordinal];
        if leaf.is_target {
            self.target = object.element(self.target_access, false);
        } else {
            let text = object.element(self.value_access, self.transposed);
            self.emit(text);
        }
    }

    fn enter(&mut self, node: &Node) {
        if let Node::Unary {
            op: UnaryOp::Trans, ..
        } = node
        {
            self.transposed = !self.transposed;
        }
        self.frames.push(Vec::new());
    }

    fn leave(&mut self, node: &Node) {
        let mut children = self.frames.pop().unwrap_or_default().into_iter();
        let mut next = || children.next().unwrap_or_default();
        let text = match node {
            Node::Unary { op, .. } => {
                let operand = next();
                match op {
                    UnaryOp::Neg => format!("(-{operand})"),
                    UnaryOp::Abs => format!("abs({operand})"),
                    UnaryOp::Sqrt => format!("sqrt({operand})"),
                    UnaryOp::Exp => format!("exp({operand})"),
                    UnaryOp::Log => format!("log({operand})"),
                    UnaryOp::Trans => {
                        self.transposed = !self.transposed;
                        operand
                    }
                }
            }
            Node::Binary { op, .. } => {
                let (lhs, rhs) = (next(), next());
                match op {
                    BinaryOp::Add => format!("({lhs} + {rhs})"),
                    BinaryOp::Sub => format!("({lhs} - {rhs})"),
                    BinaryOp::Mult | BinaryOp::ElementProd => format!("({lhs} * {rhs})"),
                    BinaryOp::Div | BinaryOp::ElementDiv => format!("({lhs} / {rhs})"),
                    BinaryOp::ElementMax => format!("max({lhs}, {rhs})"),
                    BinaryOp::ElementMin => format!("min({lhs}, {rhs})"),
                    BinaryOp::InnerProd | BinaryOp::MatVecProd => {
                        self.reduction = Some((lhs, rhs));
                        REDUCTION_RESULT.to_string()
                    }
                }
            }
            Node::Leaf(_) => return,
        };
        self.emit(text);
    }
}

/// Renders `statement` with its target addressed through `target_access` and
/// every other leaf through `value_access`.
pub fn render_statement(
    statement: &Statement,
    mapping: &Mapping,
    target_access: &Access,
    value_access: &Access,
) -> RenderedStatement {
    let mut renderer = Renderer {
        mapping,
        target_access,
        value_access,
        transposed: false,
        frames: Vec::new(),
        target: String::new(),
        value: String::new(),
        reduction: None,
    };
    traverse(statement, &mut renderer);
    RenderedStatement {
        target: renderer.target,
        assign: statement.assign_op(),
        value: renderer.value,
        reduction: renderer.reduction,
    }
}
