//! Elementwise vector statements, `y = f(x, ...)`.

use super::{common_extent, dispatch_overflows, ensure_elementwise, item_count, lane_loop};
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
pub struct VectorAxpyParameters {
    base: ParameterSet,
    num_groups: usize,
}

impl VectorAxpyParameters {
    pub fn new(
        scalar_type: ScalarType,
        simd_width: usize,
        group_size: usize,
        num_groups: usize,
    ) -> Self {
        Self {
            base: ParameterSet::new(scalar_type, simd_width, group_size, 1, 1),
            num_groups,
        }
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }
}

impl FamilyParameters for VectorAxpyParameters {
    const FAMILY: Family = Family::VectorAxpy;

    fn base(&self) -> &ParameterSet {
        &self.base
    }

    fn invalid_impl(&self, _device: &DeviceInfo) -> bool {
        self.num_groups == 0 || dispatch_overflows(self.num_groups, self.base.local_size_0())
    }

    fn extra_fields(&self) -> Vec<(&'static str, usize)> {
        vec![("num_groups", self.num_groups)]
    }

    fn fallback(scalar_type: ScalarType) -> Self {
        Self::new(scalar_type, 1, 128, 128)
    }

    fn builtin_entries() -> Vec<(DeviceKind, ScalarType, Self)> {
        vec![
            (DeviceKind::Gpu, ScalarType::F32, Self::new(ScalarType::F32, 1, 128, 128)),
            (DeviceKind::Gpu, ScalarType::F64, Self::new(ScalarType::F64, 1, 128, 128)),
            (DeviceKind::Cpu, ScalarType::F32, Self::new(ScalarType::F32, 8, 16, 64)),
            (DeviceKind::Cpu, ScalarType::F64, Self::new(ScalarType::F64, 4, 16, 64)),
        ]
    }
}

fn vector_size(statement: &Statement) -> Result<usize> {
    match statement.target().kind {
        OperandKind::Vector { size } => Ok(size),
        _ => bail!("vector kernels must assign to a vector"),
    }
}

impl KernelFamily for VectorAxpyParameters {
    fn validate(&self, statements: &[Statement]) -> Result<()> {
        ensure_elementwise(statements)?;
        let size = common_extent(
            statements.iter().map(vector_size).collect::<Result<Vec<_>>>()?,
            "vector sizes",
        )?;
        for statement in statements {
            for operand in statement.operands() {
                match operand.kind {
                    OperandKind::Vector { size: found } => ensure!(
                        found == size,
                        "vector {} has {found} elements, expected {size}",
                        operand.id
                    ),
                    OperandKind::Matrix { .. } => bail!("matrix {} in a vector kernel", operand.id),
                    OperandKind::DeviceScalar | OperandKind::HostScalar(_) => {}
                }
            }
        }
        Ok(())
    }

    fn global_arguments(&self, statements: &[Statement]) -> Result<Vec<GlobalArgument>> {
        let size = common_extent(
            statements.iter().map(vector_size).collect::<Result<Vec<_>>>()?,
            "vector sizes",
        )?;
        Ok(vec![GlobalArgument::Size {
            name: "N",
            value: size,
        }])
    }

    fn emit_stage(
        &self,
        _stage: usize,
        statements: &[Statement],
        mappings: &[Mapping],
        stream: &mut SourceStream,
    ) -> Result<()> {
        let width = self.base.simd_width();
        let access = Access::new("i", "lane", "i");
        let assignments: Vec<String> = statements
            .iter()
            .zip(mappings)
            .map(|(statement, mapping)| {
                render_statement(statement, mapping, &access, &access).assignment()
            })
            .collect();

        stream.line(format!("let items = {};", item_count(width, "N")));
        stream.block(
            format!(
                "for (var i: u32 = gid.x; i < items; i = i + ngroups.x * {}u)",
                self.base.local_size_0()
            ),
            |s| {
                lane_loop(s, width, "i", "N", |s| {
                    for assignment in &assignments {
                        s.line(assignment);
                    }
                })
            },
        );
        Ok(())
    }

    fn global_size(&self, _stage: usize) -> [usize; 2] {
        [self.num_groups.saturating_mul(self.base.local_size_0()), 1]
    }
}
