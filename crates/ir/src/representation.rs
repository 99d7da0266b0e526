//! Deterministic structural signatures for statement lists.

use crate::binder::{make_binder, BindingPolicy, SymbolicBinder};
use crate::builder::{Node, Statement};
use crate::dialect::{Layout, OperandKind, ScalarType};
use crate::traverse::{traverse, LeafRef, Visitor};

struct Representation<'b> {
    binder: &'b mut dyn SymbolicBinder,
    policy: BindingPolicy,
    out: String,
}

impl Representation<'_> {
    fn push(&mut self, token: &str) {
        if !self.out.is_empty() {
            self.out.push('_');
        }
        self.out.push_str(token);
    }
}

impl Visitor for Representation<'_> {
    fn leaf(&mut self, leaf: LeafRef<'_>) {
        let kind = match leaf.operand.kind {
            OperandKind::Vector { .. } => "v",
            OperandKind::Matrix {
                layout: Layout::RowMajor,
                ..
            } => "mr",
            OperandKind::Matrix {
                layout: Layout::ColumnMajor,
                ..
            } => "mc",
            OperandKind::DeviceScalar => "s",
            OperandKind::HostScalar(_) => "h",
        };
        let ty = match leaf.operand.scalar_type {
            ScalarType::F32 => "f",
            ScalarType::F64 => "d",
        };
        let token = match self.policy {
            BindingPolicy::AliasByIdentity => {
                format!("{kind}{ty}{}", self.binder.get(leaf.operand.id))
            }
            BindingPolicy::Independent => format!("{kind}{ty}"),
        };
        self.push(&token);
    }

    fn enter(&mut self, node: &Node) {
        let code = match node {
            Node::Unary { op, .. } => op.code(),
            Node::Binary { op, .. } => op.code(),
            Node::Leaf(_) => return,
        };
        self.push(code);
    }
}

/// Kernel-name root for a list of statements.
///
/// Structurally identical statement lists map to the same string, which lets a
/// compiled program be reused. The result is a valid identifier.
pub fn statements_representation(statements: &[Statement], policy: BindingPolicy) -> String {
    let mut binder = make_binder(policy);
    let mut out = format!("k{}", policy.code());
    for statement in statements {
        let mut repr = Representation {
            binder: binder.as_mut(),
            policy,
            out: String::new(),
        };
        repr.push(statement.assign_op().code());
        traverse(statement, &mut repr);
        out.push_str("_x_");
        out.push_str(&repr.out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Operand;

    fn v(id: u64) -> Operand {
        Operand::vector(id, 64, ScalarType::F32)
    }

    #[test]
    fn identical_shapes_share_a_signature() {
        let a = Statement::assign(v(1), Node::leaf(v(2)) + Node::leaf(v(3))).unwrap();
        let b = Statement::assign(v(10), Node::leaf(v(20)) + Node::leaf(v(30))).unwrap();
        let policy = BindingPolicy::AliasByIdentity;
        assert_eq!(
            statements_representation(&[a], policy),
            statements_representation(&[b], policy)
        );
    }

    #[test]
    fn aliasing_changes_the_signature_under_identity_policy() {
        let distinct = Statement::assign(v(1), Node::leaf(v(2)) + Node::leaf(v(3))).unwrap();
        let aliased = Statement::assign(v(1), Node::leaf(v(1)) + Node::leaf(v(3))).unwrap();

        let policy = BindingPolicy::AliasByIdentity;
        assert_ne!(
            statements_representation(&[distinct.clone()], policy),
            statements_representation(&[aliased.clone()], policy)
        );

        let policy = BindingPolicy::Independent;
        assert_eq!(
            statements_representation(&[distinct], policy),
            statements_representation(&[aliased], policy)
        );
    }

    #[test]
    fn signature_is_identifier_safe() {
        let s = Statement::inplace_add(
            v(1),
            Node::leaf(v(2)).scale(Operand::host_scalar(5, 0.5, ScalarType::F32)),
        )
        .unwrap();
        let repr = statements_representation(&[s], BindingPolicy::AliasByIdentity);
        assert_eq!(repr, "ka_x_iadd_vf0_mult_vf1_hf2");
        assert!(repr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
