//! Symbolic names for statement operands and their kernel argument layout.
//!
//! Generation and enqueue both walk statements with [`kerneltune_ir::traverse`]
//! and both expand operands through [`operand_arguments`], so argument slot
//! `i` in the generated source is the slot bound at enqueue.

use crate::params::ParameterSet;
use anyhow::{anyhow, bail, Result};
use kerneltune_device::KernelArg;
use kerneltune_ir::{
    make_binder, traverse, BindingPolicy, Layout, LeafRef, Operand, OperandKind, Statement,
    SymbolicBinder, Visitor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Target,
    Operand,
}

/// One leaf of a statement with the name it has in generated source.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedObject {
    pub name: String,
    pub operand: Operand,
    pub width: usize,
    pub role: Role,
}

/// Index expressions for the element an invocation is working on.
///
/// Vectors of width `w` address `item * w + lane` (`item` alone when `w` is
/// one); matrices use the same column index with `row` as their row.
#[derive(Debug, Clone)]
pub struct Access {
    pub item: String,
    pub lane: String,
    pub row: String,
}

impl Access {
    pub fn new(item: &str, lane: &str, row: &str) -> Self {
        Self {
            item: item.to_string(),
            lane: lane.to_string(),
            row: row.to_string(),
        }
    }

    fn flat(&self, width: usize) -> String {
        if width == 1 {
            self.item.clone()
        } else {
            format!("{} * {}u + {}", self.item, width, self.lane)
        }
    }
}

impl MappedObject {
    /// WGSL expression reading or writing this object's current element.
    pub fn element(&self, access: &Access, transposed: bool) -> String {
        match self.operand.kind {
            OperandKind::HostScalar(_) => self.name.clone(),
            OperandKind::DeviceScalar => format!("{}[0]", self.name),
            OperandKind::Vector { .. } => format!("{}[{}]", self.name, access.flat(self.width)),
            OperandKind::Matrix { layout, .. } => {
                let (mut row, mut col) = (access.row.clone(), access.flat(self.width));
                if transposed {
                    std::mem::swap(&mut row, &mut col);
                }
                let ld = format!("{}_ld", self.name);
                match layout {
                    Layout::RowMajor => format!("{}[({row}) * {ld} + {col}]", self.name),
                    Layout::ColumnMajor => format!("{}[({col}) * {ld} + {row}]", self.name),
                }
            }
        }
    }
}

/// Mapped leaves of one statement, indexed by traversal ordinal.
pub type Mapping = Vec<MappedObject>;

struct MapLeaves<'b, F> {
    binder: &'b mut dyn SymbolicBinder,
    width_of: &'b F,
    mapping: Mapping,
}

impl<F: Fn(&Operand, Role) -> usize> Visitor for MapLeaves<'_, F> {
    fn leaf(&mut self, leaf: LeafRef<'_>) {
        let role = if leaf.is_target {
            Role::Target
        } else {
            Role::Operand
        };
        let slot = self.binder.get(leaf.operand.id);
        self.mapping.push(MappedObject {
            name: format!("obj{slot}"),
            operand: *leaf.operand,
            width: (self.width_of)(leaf.operand, role),
            role,
        });
    }
}

/// Names every leaf of every statement, sharing one binder across the list.
pub fn map_statements(
    statements: &[Statement],
    policy: BindingPolicy,
    width_of: &impl Fn(&Operand, Role) -> usize,
) -> Vec<Mapping> {
    let mut binder = make_binder(policy);
    statements
        .iter()
        .map(|statement| {
            let mut visitor = MapLeaves {
                binder: binder.as_mut(),
                width_of,
                mapping: Vec::new(),
            };
            traverse(statement, &mut visitor);
            visitor.mapping
        })
        .collect()
}

/// Default width: vectors and matrices use the set's width, scalars one.
pub fn default_width(operand: &Operand, params: &ParameterSet) -> usize {
    if operand.is_scalar() {
        1
    } else {
        params.simd_width()
    }
}

/// One kernel argument contributed by an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandArgument {
    /// The operand's storage buffer.
    Data,
    /// Matrix leading dimension, by value.
    LeadingDimension,
    /// Host scalar value.
    Value,
}

/// Arguments an operand occupies, in declaration order.
pub fn operand_arguments(operand: &Operand) -> &'static [OperandArgument] {
    match operand.kind {
        OperandKind::Vector { .. } | OperandKind::DeviceScalar => &[OperandArgument::Data],
        OperandKind::Matrix { .. } => &[OperandArgument::Data, OperandArgument::LeadingDimension],
        OperandKind::HostScalar(_) => &[OperandArgument::Value],
    }
}

impl OperandArgument {
    /// `(name, read_write, type)` of the module-scope declaration.
    pub fn declaration(&self, object: &MappedObject) -> (String, bool, String) {
        let ty = object.operand.scalar_type.wgsl_name();
        match self {
            OperandArgument::Data => (object.name.clone(), true, format!("array<{ty}>")),
            OperandArgument::LeadingDimension => {
                (format!("{}_ld", object.name), false, "u32".to_string())
            }
            OperandArgument::Value => (object.name.clone(), false, ty.to_string()),
        }
    }

    pub fn runtime_value(&self, operand: &Operand) -> Result<KernelArg> {
        match (self, operand.kind) {
            (OperandArgument::Data, _) => Ok(KernelArg::Buffer(operand.id)),
            (OperandArgument::LeadingDimension, _) => {
                let ld = operand
                    .leading_dimension()
                    .ok_or_else(|| anyhow!("operand {} has no leading dimension", operand.id))?;
                Ok(KernelArg::U32(to_u32(ld)?))
            }
            (OperandArgument::Value, OperandKind::HostScalar(value)) => Ok(KernelArg::Scalar {
                value,
                scalar_type: operand.scalar_type,
            }),
            (OperandArgument::Value, _) => {
                bail!("operand {} is not passed by value", operand.id)
            }
        }
    }
}

pub(crate) fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{value} does not fit a 32-bit kernel argument"))
}

/// One operand argument at its position in the kernel signature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgumentSlot {
    pub statement: usize,
    pub ordinal: usize,
    pub operand: Operand,
    pub argument: OperandArgument,
}

struct CollectSlots<'b> {
    binder: &'b mut dyn SymbolicBinder,
    statement: usize,
    slots: Vec<ArgumentSlot>,
}

impl Visitor for CollectSlots<'_> {
    fn leaf(&mut self, leaf: LeafRef<'_>) {
        if !self.binder.bind(leaf.operand.id) {
            return;
        }
        for argument in operand_arguments(leaf.operand) {
            self.slots.push(ArgumentSlot {
                statement: self.statement,
                ordinal: leaf.ordinal,
                operand: *leaf.operand,
                argument: *argument,
            });
        }
    }
}

/// Operand arguments of a statement list in signature order.
///
/// Each call starts from a fresh binder, so repeated calls agree.
pub fn argument_slots(statements: &[Statement], policy: BindingPolicy) -> Vec<ArgumentSlot> {
    let mut binder = make_binder(policy);
    let mut slots = Vec::new();
    for (index, statement) in statements.iter().enumerate() {
        let mut visitor = CollectSlots {
            binder: binder.as_mut(),
            statement: index,
            slots,
        };
        traverse(statement, &mut visitor);
        slots = visitor.slots;
    }
    slots
}
