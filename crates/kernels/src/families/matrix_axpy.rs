//! Elementwise matrix statements, including transposed operands.

use super::{
    common_extent, dispatch_overflows, ensure_elementwise, item_count, lane_loop, matrix_shapes,
};
use crate::expression::render_statement;
use crate::mapping::{Access, Mapping};
use crate::params::{Family, FamilyParameters, ParameterSet};
use crate::stream::SourceStream;
use crate::template::{GlobalArgument, KernelFamily};
use anyhow::{bail, ensure, Result};
use kerneltune_device::{DeviceInfo, DeviceKind};
use kerneltune_ir::{OperandKind, ScalarType, Statement};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixAxpyParameters {
    base: ParameterSet,
    num_groups_0: usize,
    num_groups_1: usize,
}

impl MatrixAxpyParameters {
    pub fn new(
        scalar_type: ScalarType,
        simd_width: usize,
        local_size_0: usize,
        local_size_1: usize,
        num_groups_0: usize,
        num_groups_1: usize,
    ) -> Self {
        Self {
            base: ParameterSet::new(scalar_type, simd_width, local_size_0, local_size_1, 1),
            num_groups_0,
            num_groups_1,
        }
    }

    pub fn num_groups_0(&self) -> usize {
        self.num_groups_0
    }

    pub fn num_groups_1(&self) -> usize {
        self.num_groups_1
    }
}

impl FamilyParameters for MatrixAxpyParameters {
    const FAMILY: Family = Family::MatrixAxpy;

    fn base(&self) -> &ParameterSet {
        &self.base
    }

    fn invalid_impl(&self, _device: &DeviceInfo) -> bool {
        self.num_groups_0 == 0
            || self.num_groups_1 == 0
            || dispatch_overflows(self.num_groups_0, self.base.local_size_0())
            || dispatch_overflows(self.num_groups_1, self.base.local_size_1())
    }

    fn extra_fields(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("num_groups_0", self.num_groups_0),
            ("num_groups_1", self.num_groups_1),
        ]
    }

    fn fallback(scalar_type: ScalarType) -> Self {
        Self::new(scalar_type, 1, 8, 8, 16, 16)
    }

    fn builtin_entries() -> Vec<(DeviceKind, ScalarType, Self)> {
        use ScalarType::{F32, F64};
        vec![
            (DeviceKind::Gpu, F32, Self::new(F32, 1, 16, 16, 16, 16)),
            (DeviceKind::Gpu, F64, Self::new(F64, 1, 16, 16, 16, 16)),
            (DeviceKind::Cpu, F32, Self::new(F32, 4, 8, 8, 8, 8)),
            (DeviceKind::Cpu, F64, Self::new(F64, 2, 8, 8, 8, 8)),
        ]
    }
}

fn target_shape(statement: &Statement) -> Result<(usize, usize)> {
    match statement.target().kind {
        OperandKind::Matrix { rows, cols, .. } => Ok((rows, cols)),
        _ => bail!("matrix kernels must assign to a matrix"),
    }
}

fn common_shape(statements: &[Statement]) -> Result<(usize, usize)> {
    let shapes = statements
        .iter()
        .map(target_shape)
        .collect::<Result<Vec<_>>>()?;
    let rows = common_extent(shapes.iter().map(|s| s.0), "matrix row counts")?;
    let cols = common_extent(shapes.iter().map(|s| s.1), "matrix column counts")?;
    Ok((rows, cols))
}

impl KernelFamily for MatrixAxpyParameters {
    fn validate(&self, statements: &[Statement]) -> Result<()> {
        ensure_elementwise(statements)?;
        let shape = common_shape(statements)?;
        for statement in statements {
            for operand in statement.operands() {
                ensure!(
                    !matches!(operand.kind, OperandKind::Vector { .. }),
                    "vector {} in a matrix kernel",
                    operand.id
                );
            }
            for found in matrix_shapes(statement.value()) {
                ensure!(
                    found == shape,
                    "operand shape {found:?} does not match target shape {shape:?}"
                );
            }
        }
        Ok(())
    }

    fn global_arguments(&self, statements: &[Statement]) -> Result<Vec<GlobalArgument>> {
        let (rows, cols) = common_shape(statements)?;
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

    fn emit_stage(
        &self,
        _stage: usize,
        statements: &[Statement],
        mappings: &[Mapping],
        stream: &mut SourceStream,
    ) -> Result<()> {
        let width = self.base.simd_width();
        let access = Access::new("c", "lane", "r");
        let assignments: Vec<String> = statements
            .iter()
            .zip(mappings)
            .map(|(statement, mapping)| {
                render_statement(statement, mapping, &access, &access).assignment()
            })
            .collect();

        stream.line(format!("let col_items = {};", item_count(width, "N")));
        stream.block(
            format!(
                "for (var r: u32 = gid.y; r < M; r = r + ngroups.y * {}u)",
                self.base.local_size_1()
            ),
            |s| {
                s.block(
                    format!(
                        "for (var c: u32 = gid.x; c < col_items; c = c + ngroups.x * {}u)",
                        self.base.local_size_0()
                    ),
                    |s| {
                        lane_loop(s, width, "c", "N", |s| {
                            for assignment in &assignments {
                                s.line(assignment);
                            }
                        })
                    },
                )
            },
        );
        Ok(())
    }

    fn global_size(&self, _stage: usize) -> [usize; 2] {
        [
            self.num_groups_0.saturating_mul(self.base.local_size_0()),
            self.num_groups_1.saturating_mul(self.base.local_size_1()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::KernelTemplate;
    use kerneltune_ir::{BindingPolicy, Layout, Node, Operand};

    fn matrix(id: u64, rows: usize, cols: usize, layout: Layout) -> Operand {
        Operand::matrix(id, rows, cols, layout, ScalarType::F32)
    }

    #[test]
    fn transposed_operands_must_match_after_transposition() {
        let params = MatrixAxpyParameters::fallback(ScalarType::F32);
        let a = matrix(1, 4, 6, Layout::RowMajor);
        let b = matrix(2, 6, 4, Layout::ColumnMajor);
        let ok = Statement::assign(a, Node::leaf(b).trans()).unwrap();
        assert!(params.validate(&[ok]).is_ok());

        let bad = Statement::assign(a, Node::leaf(b)).unwrap();
        assert!(params.validate(&[bad]).is_err());
    }

    #[test]
    fn leading_dimensions_are_declared_and_used() {
        let params = MatrixAxpyParameters::new(ScalarType::F32, 2, 16, 4, 4, 4);
        let a = matrix(1, 32, 32, Layout::RowMajor);
        let b = matrix(2, 32, 32, Layout::ColumnMajor);
        let alpha = Operand::host_scalar(3, 2.0, ScalarType::F32);
        let statement = Statement::assign(a, Node::leaf(b).scale(alpha)).unwrap();

        let source = KernelTemplate::new(&params, BindingPolicy::AliasByIdentity)
            .generate(&[statement])
            .unwrap();
        assert!(source.contains("var<storage, read> obj0_ld: u32;"));
        assert!(source.contains("var<storage, read> obj1_ld: u32;"));
        assert!(source.contains(
            "obj0[(r) * obj0_ld + c * 2u + lane] = (obj1[(c * 2u + lane) * obj1_ld + r] * obj2);"
        ));
        assert!(source.contains("@workgroup_size(16, 4, 1)"));
    }

    #[test]
    fn global_size_covers_both_dimensions() {
        let params = MatrixAxpyParameters::new(ScalarType::F32, 1, 16, 4, 3, 5);
        assert_eq!(params.global_size(0), [48, 20]);
    }
}
