//! Matrix-vector products, `y = op(A) x`.
//!
//! Each work group owns `local_size_0` rows at a time; the `local_size_1`
//! invocations of a row split its columns and combine them with a tree
//! reduction.

use super::{
    common_extent, dispatch_overflows, item_count, lane_loop, matrix_shapes, reduction_operands,
    tree_reduce, vector_sizes,
};
use crate::expression::render_statement;
use crate::mapping::{default_width, Access, Mapping, Role};
use crate::params::{Family, FamilyParameters, ParameterSet};
use crate::stream::SourceStream;
use crate::template::{GlobalArgument, KernelFamily, Prototype};
use anyhow::{anyhow, bail, ensure, Result};
use kerneltune_device::{DeviceInfo, DeviceKind};
use kerneltune_ir::{BinaryOp, Operand, OperandKind, ScalarType, Statement};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowWiseReductionParameters {
    base: ParameterSet,
    num_groups_0: usize,
}

impl RowWiseReductionParameters {
    pub fn new(
        scalar_type: ScalarType,
        simd_width: usize,
        local_size_0: usize,
        local_size_1: usize,
        num_groups_0: usize,
    ) -> Self {
        Self {
            base: ParameterSet::new(scalar_type, simd_width, local_size_0, local_size_1, 1),
            num_groups_0,
        }
    }

    pub fn num_groups_0(&self) -> usize {
        self.num_groups_0
    }
}

impl FamilyParameters for RowWiseReductionParameters {
    const FAMILY: Family = Family::RowWiseReduction;

    fn base(&self) -> &ParameterSet {
        &self.base
    }

    fn local_memory_bytes(&self) -> usize {
        self.base
            .work_group_size()
            .map_or(usize::MAX, |size| {
                size.saturating_mul(self.base.scalar_type().size_bytes())
            })
    }

    fn invalid_impl(&self, _device: &DeviceInfo) -> bool {
        !self.base.local_size_1().is_power_of_two()
            || self.num_groups_0 == 0
            || dispatch_overflows(self.num_groups_0, self.base.local_size_0())
    }

    fn extra_fields(&self) -> Vec<(&'static str, usize)> {
        vec![("num_groups_0", self.num_groups_0)]
    }

    fn fallback(scalar_type: ScalarType) -> Self {
        Self::new(scalar_type, 1, 8, 8, 64)
    }

    fn builtin_entries() -> Vec<(DeviceKind, ScalarType, Self)> {
        use ScalarType::{F32, F64};
        vec![
            (DeviceKind::Gpu, F32, Self::new(F32, 1, 4, 64, 128)),
            (DeviceKind::Gpu, F64, Self::new(F64, 1, 4, 64, 64)),
            (DeviceKind::Cpu, F32, Self::new(F32, 4, 2, 8, 32)),
            (DeviceKind::Cpu, F64, Self::new(F64, 2, 2, 8, 32)),
        ]
    }
}

/// Output length and reduced length of one product statement.
fn product_extents(statement: &Statement) -> Result<(usize, usize)> {
    let OperandKind::Vector { size: rows } = statement.target().kind else {
        bail!("matrix-vector products must assign to a vector");
    };
    let (matrix, vector) = reduction_operands(statement, BinaryOp::MatVecProd)?;
    let shape = common_extent_pair(matrix_shapes(matrix))?;
    let cols = common_extent(vector_sizes(vector), "product vector lengths")?;
    ensure!(
        shape == (rows, cols),
        "matrix of shape {shape:?} cannot map {cols} elements onto {rows}"
    );
    Ok((rows, cols))
}

fn common_extent_pair(shapes: Vec<(usize, usize)>) -> Result<(usize, usize)> {
    let rows = common_extent(shapes.iter().map(|s| s.0), "matrix row counts")?;
    let cols = common_extent(shapes.iter().map(|s| s.1), "matrix column counts")?;
    Ok((rows, cols))
}

fn common_product_extents(statements: &[Statement]) -> Result<(usize, usize)> {
    let extents = statements
        .iter()
        .map(product_extents)
        .collect::<Result<Vec<_>>>()?;
    common_extent_pair(extents)
}

impl KernelFamily for RowWiseReductionParameters {
    fn validate(&self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            let (matrix, vector) = reduction_operands(statement, BinaryOp::MatVecProd)?;
            let mut misplaced = None;
            matrix.for_each_operand(&mut |operand| {
                if matches!(operand.kind, OperandKind::Vector { .. }) {
                    misplaced = Some(operand.id);
                }
            });
            vector.for_each_operand(&mut |operand| {
                if matches!(operand.kind, OperandKind::Matrix { .. }) {
                    misplaced = Some(operand.id);
                }
            });
            if let Some(id) = misplaced {
                bail!("operand {id} is on the wrong side of the product");
            }
        }
        common_product_extents(statements)?;
        Ok(())
    }

    /// The output is written once per row, so it is never widened.
    fn assign_width(&self, operand: &Operand, role: Role) -> usize {
        match role {
            Role::Target => 1,
            Role::Operand => default_width(operand, &self.base),
        }
    }

    fn global_arguments(&self, statements: &[Statement]) -> Result<Vec<GlobalArgument>> {
        let (rows, cols) = common_product_extents(statements)?;
        Ok(vec![
            GlobalArgument::Size {
                name: "M",
                value: rows,
            },
            GlobalArgument::Size {
                name: "N",
                value: cols,
            },
        ])
    }

    fn emit_workgroup_memory(
        &self,
        statements: &[Statement],
        prototype: &mut Prototype,
    ) -> Result<()> {
        let size = self
            .base
            .work_group_size()
            .ok_or_else(|| anyhow!("work group size overflows"))?;
        for k in 0..statements.len() {
            prototype.workgroup_array(format!("buf{k}"), size);
        }
        Ok(())
    }

    fn emit_stage(
        &self,
        _stage: usize,
        statements: &[Statement],
        mappings: &[Mapping],
        stream: &mut SourceStream,
    ) -> Result<()> {
        let width = self.base.simd_width();
        let rows_per_group = self.base.local_size_0();
        let lanes = self.base.local_size_1();
        let ty = self.base.scalar_type().wgsl_name();
        let target_access = Access::new("r", "lane", "r");
        let value_access = Access::new("c", "lane", "r");
        let slot = format!("lid.x * {lanes}u + lid.y");
        let buffers: Vec<String> = (0..statements.len()).map(|k| format!("buf{k}")).collect();

        let mut products = Vec::with_capacity(statements.len());
        let mut assignments = Vec::with_capacity(statements.len());
        for (k, (statement, mapping)) in statements.iter().zip(mappings).enumerate() {
            let rendered = render_statement(statement, mapping, &target_access, &value_access);
            let (matrix, vector) = rendered
                .reduction
                .clone()
                .ok_or_else(|| anyhow!("statement {k} has no matrix-vector product"))?;
            products.push(format!("acc{k} = acc{k} + {matrix} * {vector};"));
            assignments.push(rendered.assignment_of(&format!("buf{k}[lid.x * {lanes}u]")));
        }

        stream.line(format!(
            "let row_blocks = (M + {}u) / {rows_per_group}u;",
            rows_per_group.saturating_sub(1)
        ));
        stream.line(format!("let col_items = {};", item_count(width, "N")));
        stream.block(
            "for (var block: u32 = gpid.x; block < row_blocks; block = block + ngroups.x)",
            |s| {
                s.line(format!("let r = block * {rows_per_group}u + lid.x;"));
                for k in 0..statements.len() {
                    s.line(format!("var acc{k}: {ty} = 0.0;"));
                }
                s.block("if (r < M)", |s| {
                    s.block(
                        format!("for (var c: u32 = lid.y; c < col_items; c = c + {lanes}u)"),
                        |s| {
                            lane_loop(s, width, "c", "N", |s| {
                                for product in &products {
                                    s.line(product);
                                }
                            })
                        },
                    );
                });
                for (k, buffer) in buffers.iter().enumerate() {
                    s.line(format!("{buffer}[{slot}] = acc{k};"));
                }
                tree_reduce(s, &buffers, lanes, "lid.y", &slot);
                s.block("if (lid.y == 0u && r < M)", |s| {
                    for assignment in &assignments {
                        s.line(assignment);
                    }
                });
                s.line("workgroupBarrier();");
            },
        );
        Ok(())
    }

    fn global_size(&self, _stage: usize) -> [usize; 2] {
        [
            self.num_groups_0.saturating_mul(self.base.local_size_0()),
            self.base.local_size_1(),
        ]
    }
}
