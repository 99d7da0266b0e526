//! Operand and operator definitions for kernel statements.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an underlying device resource.
///
/// Two operands carrying the same id refer to the same buffer, which is what the
/// alias-by-identity binding policy keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    F32,
    F64,
}

impl ScalarType {
    pub fn size_bytes(&self) -> usize {
        match self {
            ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }

    /// Type name in generated WGSL.
    pub fn wgsl_name(&self) -> &'static str {
        match self {
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }

    pub fn from_size_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            4 => Some(ScalarType::F32),
            8 => Some(ScalarType::F64),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wgsl_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    RowMajor,
    ColumnMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OperandKind {
    Vector { size: usize },
    Matrix { rows: usize, cols: usize, layout: Layout },
    /// Single value living in a one-element device buffer.
    DeviceScalar,
    /// Value passed to the kernel by value.
    HostScalar(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    pub id: ResourceId,
    pub scalar_type: ScalarType,
    pub kind: OperandKind,
}

impl Operand {
    pub fn vector(id: u64, size: usize, scalar_type: ScalarType) -> Self {
        Self {
            id: ResourceId(id),
            scalar_type,
            kind: OperandKind::Vector { size },
        }
    }

    pub fn matrix(id: u64, rows: usize, cols: usize, layout: Layout, scalar_type: ScalarType) -> Self {
        Self {
            id: ResourceId(id),
            scalar_type,
            kind: OperandKind::Matrix { rows, cols, layout },
        }
    }

    pub fn device_scalar(id: u64, scalar_type: ScalarType) -> Self {
        Self {
            id: ResourceId(id),
            scalar_type,
            kind: OperandKind::DeviceScalar,
        }
    }

    pub fn host_scalar(id: u64, value: f64, scalar_type: ScalarType) -> Self {
        Self {
            id: ResourceId(id),
            scalar_type,
            kind: OperandKind::HostScalar(value),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self.kind,
            OperandKind::DeviceScalar | OperandKind::HostScalar(_)
        )
    }

    /// Number of scalar elements backing the operand on the device.
    pub fn element_count(&self) -> usize {
        match self.kind {
            OperandKind::Vector { size } => size,
            OperandKind::Matrix { rows, cols, .. } => rows * cols,
            OperandKind::DeviceScalar => 1,
            OperandKind::HostScalar(_) => 0,
        }
    }

    /// Leading dimension of a matrix in its storage layout.
    pub fn leading_dimension(&self) -> Option<usize> {
        match self.kind {
            OperandKind::Matrix {
                rows,
                cols,
                layout,
            } => Some(match layout {
                Layout::RowMajor => cols,
                Layout::ColumnMajor => rows,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log,
    Trans,
}

impl UnaryOp {
    pub fn code(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Trans => "trans",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    /// Scaling by a scalar operand.
    Mult,
    /// Division by a scalar operand.
    Div,
    ElementProd,
    ElementDiv,
    ElementMax,
    ElementMin,
    InnerProd,
    MatVecProd,
}

impl BinaryOp {
    pub fn code(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mult => "mult",
            BinaryOp::Div => "div",
            BinaryOp::ElementProd => "eprod",
            BinaryOp::ElementDiv => "ediv",
            BinaryOp::ElementMax => "emax",
            BinaryOp::ElementMin => "emin",
            BinaryOp::InnerProd => "inner",
            BinaryOp::MatVecProd => "gemv",
        }
    }

    /// Reductions cannot be evaluated elementwise.
    pub fn is_reduction(&self) -> bool {
        matches!(self, BinaryOp::InnerProd | BinaryOp::MatVecProd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssignOp {
    Assign,
    InplaceAdd,
    InplaceSub,
}

impl AssignOp {
    pub fn code(&self) -> &'static str {
        match self {
            AssignOp::Assign => "assign",
            AssignOp::InplaceAdd => "iadd",
            AssignOp::InplaceSub => "isub",
        }
    }

    /// Operator token in generated source.
    pub fn token(&self) -> &'static str {
        match self {
            AssignOp::Assign => "=",
            AssignOp::InplaceAdd => "+=",
            AssignOp::InplaceSub => "-=",
        }
    }
}
