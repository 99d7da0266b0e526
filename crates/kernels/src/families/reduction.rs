//! Inner products into device scalars.
//!
//! Stage 0 reduces each work group's share of the vectors into one partial
//! per group in a scratch buffer; stage 1 runs a single group that folds the
//! partials into the target.

use super::{
    common_extent, dispatch_overflows, item_count, lane_loop, reduction_operands, tree_reduce,
    vector_sizes,
};
use crate::expression::render_statement;
use crate::mapping::{Access, Mapping};
use crate::params::{Family, FamilyParameters, ParameterSet};
use crate::stream::SourceStream;
use crate::template::{GlobalArgument, KernelFamily, Prototype};
use anyhow::{anyhow, ensure, Result};
use kerneltune_device::{DeviceInfo, DeviceKind};
use kerneltune_ir::{BinaryOp, OperandKind, ResourceId, ScalarType, Statement};
use serde::{Deserialize, Serialize};

/// Resource id of the partial-sum scratch buffer.
pub const REDUCTION_SCRATCH: ResourceId = ResourceId(u64::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReductionParameters {
    base: ParameterSet,
    num_groups: usize,
}

impl ReductionParameters {
    pub fn new(
        scalar_type: ScalarType,
        simd_width: usize,
        group_size: usize,
        num_groups: usize,
    ) -> Self {
        Self {
            base: ParameterSet::new(scalar_type, simd_width, group_size, 1, 2),
            num_groups,
        }
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    fn group_size(&self) -> usize {
        self.base.local_size_0()
    }
}

impl FamilyParameters for ReductionParameters {
    const FAMILY: Family = Family::Reduction;

    fn base(&self) -> &ParameterSet {
        &self.base
    }

    fn local_memory_bytes(&self) -> usize {
        self.group_size()
            .saturating_mul(self.base.scalar_type().size_bytes())
    }

    fn invalid_impl(&self, _device: &DeviceInfo) -> bool {
        !self.group_size().is_power_of_two()
            || self.num_groups == 0
            || dispatch_overflows(self.num_groups, self.group_size())
    }

    fn extra_fields(&self) -> Vec<(&'static str, usize)> {
        vec![("num_groups", self.num_groups)]
    }

    fn fallback(scalar_type: ScalarType) -> Self {
        Self::new(scalar_type, 1, 128, 128)
    }

    fn builtin_entries() -> Vec<(DeviceKind, ScalarType, Self)> {
        use ScalarType::{F32, F64};
        vec![
            (DeviceKind::Gpu, F32, Self::new(F32, 1, 256, 64)),
            (DeviceKind::Gpu, F64, Self::new(F64, 1, 128, 64)),
            (DeviceKind::Cpu, F32, Self::new(F32, 8, 16, 32)),
            (DeviceKind::Cpu, F64, Self::new(F64, 4, 16, 32)),
        ]
    }
}

fn reduced_length(statements: &[Statement]) -> Result<usize> {
    let mut lengths = Vec::new();
    for statement in statements {
        lengths.extend(vector_sizes(statement.value()));
    }
    common_extent(lengths, "inner product lengths")
}

fn partials(statement: usize) -> String {
    format!("acc{statement}")
}

fn local_buffer(statement: usize) -> String {
    format!("buf{statement}")
}

impl KernelFamily for ReductionParameters {
    fn validate(&self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            ensure!(
                matches!(statement.target().kind, OperandKind::DeviceScalar),
                "reductions must assign to a device scalar"
            );
            reduction_operands(statement, BinaryOp::InnerProd)?;
            for operand in statement.operands() {
                ensure!(
                    !matches!(operand.kind, OperandKind::Matrix { .. }),
                    "matrix {} in an inner product",
                    operand.id
                );
            }
        }
        reduced_length(statements)?;
        Ok(())
    }

    fn global_arguments(&self, statements: &[Statement]) -> Result<Vec<GlobalArgument>> {
        Ok(vec![
            GlobalArgument::Size {
                name: "N",
                value: reduced_length(statements)?,
            },
            GlobalArgument::Scratch {
                name: "temp",
                id: REDUCTION_SCRATCH,
                len: statements.len() * self.num_groups,
            },
        ])
    }

    fn emit_workgroup_memory(
        &self,
        statements: &[Statement],
        prototype: &mut Prototype,
    ) -> Result<()> {
        for k in 0..statements.len() {
            prototype.workgroup_array(local_buffer(k), self.group_size());
        }
        Ok(())
    }

    fn emit_stage(
        &self,
        stage: usize,
        statements: &[Statement],
        mappings: &[Mapping],
        stream: &mut SourceStream,
    ) -> Result<()> {
        let width = self.base.simd_width();
        let group_size = self.group_size();
        let groups = self.num_groups;
        let ty = self.base.scalar_type().wgsl_name();
        let access = Access::new("i", "lane", "i");
        let buffers: Vec<String> = (0..statements.len()).map(local_buffer).collect();

        let mut products = Vec::with_capacity(statements.len());
        let mut assignments = Vec::with_capacity(statements.len());
        for (k, (statement, mapping)) in statements.iter().zip(mappings).enumerate() {
            let rendered = render_statement(statement, mapping, &access, &access);
            let (lhs, rhs) = rendered
                .reduction
                .clone()
                .ok_or_else(|| anyhow!("statement {k} has no inner product"))?;
            products.push(format!("{acc} = {acc} + {lhs} * {rhs};", acc = partials(k)));
            assignments.push(rendered.assignment_of(&format!("{}[0]", local_buffer(k))));
        }

        for k in 0..statements.len() {
            stream.line(format!("var {}: {ty} = 0.0;", partials(k)));
        }
        if stage == 0 {
            stream.line(format!("let items = {};", item_count(width, "N")));
            stream.block(
                format!("for (var i: u32 = gid.x; i < items; i = i + ngroups.x * {group_size}u)"),
                |s| {
                    lane_loop(s, width, "i", "N", |s| {
                        for product in &products {
                            s.line(product);
                        }
                    })
                },
            );
        } else {
            stream.block(
                format!("for (var i: u32 = lid.x; i < {groups}u; i = i + {group_size}u)"),
                |s| {
                    for k in 0..statements.len() {
                        s.line(format!(
                            "{acc} = {acc} + temp[{k}u * {groups}u + i];",
                            acc = partials(k)
                        ));
                    }
                },
            );
        }
        for (k, buffer) in buffers.iter().enumerate() {
            stream.line(format!("{buffer}[lid.x] = {};", partials(k)));
        }
        tree_reduce(stream, &buffers, group_size, "lid.x", "lid.x");
        stream.block("if (lid.x == 0u)", |s| {
            if stage == 0 {
                for (k, buffer) in buffers.iter().enumerate() {
                    s.line(format!("temp[{k}u * {groups}u + gpid.x] = {buffer}[0];"));
                }
            } else {
                for assignment in &assignments {
                    s.line(assignment);
                }
            }
        });
        Ok(())
    }

    fn global_size(&self, stage: usize) -> [usize; 2] {
        match stage {
            0 => [self.num_groups.saturating_mul(self.group_size()), 1],
            _ => [self.group_size(), 1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::KernelTemplate;
    use kerneltune_device::{compute_entry_points, ComputeDevice, SimulatedDevice};
    use kerneltune_ir::{BindingPolicy, Node, Operand};

    fn dot(target: u64) -> Statement {
        let x = Operand::vector(1, 4096, ScalarType::F32);
        let y = Operand::vector(2, 4096, ScalarType::F32);
        Statement::assign(
            Operand::device_scalar(target, ScalarType::F32),
            Node::inner_prod(Node::leaf(x), Node::leaf(y)),
        )
        .unwrap()
    }

    #[test]
    fn two_stages_are_generated() {
        let params = ReductionParameters::new(ScalarType::F32, 2, 128, 64);
        let template = KernelTemplate::new(&params, BindingPolicy::AliasByIdentity);
        let statements = [dot(10)];
        let source = template.generate(&statements).unwrap();
        let prefix = template.kernel_prefix(&statements);
        assert_eq!(
            compute_entry_points(&source),
            vec![format!("{prefix}0"), format!("{prefix}1")]
        );
        assert!(source.contains("var<workgroup> buf0: array<f32, 128>;"));
        assert!(source.contains("acc0 = acc0 + obj1[i * 2u + lane] * obj2[i * 2u + lane];"));
        assert!(source.contains("temp[0u * 64u + gpid.x] = buf0[0];"));
        assert!(source.contains("obj0[0] = buf0[0];"));
    }

    #[test]
    fn group_size_must_be_a_power_of_two() {
        let device = SimulatedDevice::gpu();
        assert!(ReductionParameters::new(ScalarType::F32, 1, 96, 64).is_invalid(device.info()));
        assert!(!ReductionParameters::new(ScalarType::F32, 1, 128, 64).is_invalid(device.info()));
    }

    #[test]
    fn local_memory_scales_with_group_and_scalar_size() {
        assert_eq!(
            ReductionParameters::new(ScalarType::F64, 1, 256, 8).local_memory_bytes(),
            2048
        );
    }

    #[test]
    fn statements_must_be_inner_products_into_scalars() {
        let params = ReductionParameters::fallback(ScalarType::F32);
        let x = Operand::vector(1, 16, ScalarType::F32);
        let elementwise = Statement::assign(x, Node::leaf(x) + Node::leaf(x)).unwrap();
        assert!(params.validate(&[elementwise]).is_err());
        assert!(params.validate(&[dot(10), dot(11)]).is_ok());
    }

    #[test]
    fn scratch_holds_one_partial_per_group_and_statement() {
        let params = ReductionParameters::new(ScalarType::F32, 1, 64, 32);
        let arguments = params.global_arguments(&[dot(10), dot(11)]).unwrap();
        assert_eq!(
            arguments[1],
            GlobalArgument::Scratch {
                name: "temp",
                id: REDUCTION_SCRATCH,
                len: 64
            }
        );
        assert_eq!(params.global_size(0), [2048, 1]);
        assert_eq!(params.global_size(1), [64, 1]);
    }
}
