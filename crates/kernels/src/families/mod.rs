//! Operation families and the WGSL building blocks they share.

pub mod matrix_axpy;
pub mod reduction;
pub mod row_wise_reduction;
pub mod vector_axpy;

pub use matrix_axpy::*;
pub use reduction::*;
pub use row_wise_reduction::*;
pub use vector_axpy::*;

use crate::stream::SourceStream;
use anyhow::{bail, ensure, Result};
use kerneltune_ir::{BinaryOp, Node, OperandKind, Statement, UnaryOp};

/// True when `groups * size` work items cannot be dispatched.
pub(crate) fn dispatch_overflows(groups: usize, size: usize) -> bool {
    groups
        .checked_mul(size)
        .map_or(true, |items| u32::try_from(items).is_err())
}

/// Number of width-wide chunks covering `extent` elements.
pub(crate) fn item_count(width: usize, extent: &str) -> String {
    if width == 1 {
        extent.to_string()
    } else {
        format!("({extent} + {}u) / {width}u", width - 1)
    }
}

/// Runs `body` once per lane of chunk `item`, skipping lanes past `extent`.
pub(crate) fn lane_loop(
    stream: &mut SourceStream,
    width: usize,
    item: &str,
    extent: &str,
    body: impl FnOnce(&mut SourceStream),
) {
    if width == 1 {
        body(stream);
        return;
    }
    stream.block(
        format!("for (var lane: u32 = 0u; lane < {width}u; lane = lane + 1u)"),
        |s| s.block(format!("if ({item} * {width}u + lane < {extent})"), body),
    );
}

/// Workgroup tree reduction of `buffers` over `span` lanes indexed by `lane`.
///
/// `slot` addresses the lane's element and `slot + stride` its partner.
/// Must be emitted in uniform control flow.
pub(crate) fn tree_reduce(
    stream: &mut SourceStream,
    buffers: &[String],
    span: usize,
    lane: &str,
    slot: &str,
) {
    stream.line("workgroupBarrier();");
    stream.block(
        format!(
            "for (var stride: u32 = {}u; stride > 0u; stride = stride >> 1u)",
            span / 2
        ),
        |s| {
            s.block(format!("if ({lane} < stride)"), |s| {
                for buffer in buffers {
                    s.line(format!(
                        "{buffer}[{slot}] = {buffer}[{slot}] + {buffer}[{slot} + stride];"
                    ));
                }
            });
            s.line("workgroupBarrier();");
        },
    );
}

/// Logical `(rows, cols)` of every matrix leaf, with transpositions applied.
pub(crate) fn matrix_shapes(node: &Node) -> Vec<(usize, usize)> {
    fn walk(node: &Node, transposed: bool, shapes: &mut Vec<(usize, usize)>) {
        match node {
            Node::Leaf(operand) => {
                if let OperandKind::Matrix { rows, cols, .. } = operand.kind {
                    shapes.push(if transposed { (cols, rows) } else { (rows, cols) });
                }
            }
            Node::Unary { op, operand } => {
                walk(operand, transposed ^ (*op == UnaryOp::Trans), shapes)
            }
            Node::Binary { lhs, rhs, .. } => {
                walk(lhs, transposed, shapes);
                walk(rhs, transposed, shapes);
            }
        }
    }
    let mut shapes = Vec::new();
    walk(node, false, &mut shapes);
    shapes
}

pub(crate) fn vector_sizes(node: &Node) -> Vec<usize> {
    let mut sizes = Vec::new();
    node.for_each_operand(&mut |operand| {
        if let OperandKind::Vector { size } = operand.kind {
            sizes.push(size);
        }
    });
    sizes
}

/// The two operands of a statement whose value is exactly one `op` node.
pub(crate) fn reduction_operands(statement: &Statement, op: BinaryOp) -> Result<(&Node, &Node)> {
    match statement.value() {
        Node::Binary { op: found, lhs, rhs } if *found == op => {
            ensure!(
                !lhs.contains_reduction() && !rhs.contains_reduction(),
                "nested reductions are not supported"
            );
            Ok((lhs, rhs))
        }
        _ => bail!("statement value must be a single `{}` node", op.code()),
    }
}

/// Fails if any statement value contains a reduction.
pub(crate) fn ensure_elementwise(statements: &[Statement]) -> Result<()> {
    for statement in statements {
        ensure!(
            !statement.value().contains_reduction(),
            "elementwise kernels cannot contain reductions"
        );
    }
    Ok(())
}

/// The value all items share, or an error naming `what`.
pub(crate) fn common_extent(values: impl IntoIterator<Item = usize>, what: &str) -> Result<usize> {
    let mut values = values.into_iter();
    let Some(first) = values.next() else {
        bail!("no {what} to size the kernel with");
    };
    for value in values {
        ensure!(value == first, "{what} differ: {first} and {value}");
    }
    Ok(first)
}
