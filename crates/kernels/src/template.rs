//! Kernel template protocol: source generation and argument binding.

use crate::mapping::{
    argument_slots, default_width, map_statements, to_u32, ArgumentSlot, Mapping, Role,
};
use crate::params::FamilyParameters;
use crate::stream::SourceStream;
use anyhow::{ensure, Context, Result};
use kerneltune_device::{ComputeDevice, Kernel, KernelArg};
use kerneltune_ir::{
    statements_representation, BindingPolicy, Operand, ResourceId, ScalarType, Statement,
};
use tracing::debug;

/// Builtins every generated entry point receives.
const ENTRY_BUILTINS: &str = "@builtin(global_invocation_id) gid: vec3<u32>, \
@builtin(local_invocation_id) lid: vec3<u32>, \
@builtin(workgroup_id) gpid: vec3<u32>, \
@builtin(num_workgroups) ngroups: vec3<u32>";

/// A family argument that does not come from a statement operand.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalArgument {
    /// An extent passed by value.
    Size { name: &'static str, value: usize },
    /// Zero-initialised device scratch of `len` scalars.
    Scratch {
        name: &'static str,
        id: ResourceId,
        len: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    name: String,
    read_write: bool,
    ty: String,
}

/// Module-scope declarations of a generated program, in binding order.
#[derive(Debug, Clone)]
pub struct Prototype {
    scalar_type: ScalarType,
    bindings: Vec<Binding>,
    workgroup: Vec<(String, usize)>,
}

impl Prototype {
    pub fn new(scalar_type: ScalarType) -> Self {
        Self {
            scalar_type,
            bindings: Vec::new(),
            workgroup: Vec::new(),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    /// Declares the next storage binding.
    pub fn storage(&mut self, name: impl Into<String>, read_write: bool, ty: impl Into<String>) {
        self.bindings.push(Binding {
            name: name.into(),
            read_write,
            ty: ty.into(),
        });
    }

    /// Declares a `var<workgroup>` array of `len` scalars.
    pub fn workgroup_array(&mut self, name: impl Into<String>, len: usize) {
        self.workgroup.push((name.into(), len));
    }

    pub fn binding_names(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.name.as_str()).collect()
    }

    fn write(&self, stream: &mut SourceStream) {
        for (index, binding) in self.bindings.iter().enumerate() {
            let access = if binding.read_write { "read_write" } else { "read" };
            stream.line(format!(
                "@group(0) @binding({index}) var<storage, {access}> {}: {};",
                binding.name, binding.ty
            ));
        }
        if !self.workgroup.is_empty() {
            stream.blank();
        }
        for (name, len) in &self.workgroup {
            stream.line(format!(
                "var<workgroup> {name}: array<{}, {len}>;",
                self.scalar_type.wgsl_name()
            ));
        }
    }
}

/// Capabilities every operation family provides to the template.
pub trait KernelFamily: FamilyParameters {
    /// Rejects statement lists this family cannot generate.
    fn validate(&self, statements: &[Statement]) -> Result<()>;

    fn assign_width(&self, operand: &Operand, _role: Role) -> usize {
        default_width(operand, self.base())
    }

    fn global_arguments(&self, statements: &[Statement]) -> Result<Vec<GlobalArgument>>;

    fn emit_global_arguments(
        &self,
        statements: &[Statement],
        prototype: &mut Prototype,
    ) -> Result<()> {
        let ty = prototype.scalar_type().wgsl_name();
        for argument in self.global_arguments(statements)? {
            match argument {
                GlobalArgument::Size { name, .. } => prototype.storage(name, false, "u32"),
                GlobalArgument::Scratch { name, .. } => {
                    prototype.storage(name, true, format!("array<{ty}>"))
                }
            }
        }
        Ok(())
    }

    fn emit_workgroup_memory(
        &self,
        _statements: &[Statement],
        _prototype: &mut Prototype,
    ) -> Result<()> {
        Ok(())
    }

    /// Body of entry point `stage`, written one level inside the function.
    fn emit_stage(
        &self,
        stage: usize,
        statements: &[Statement],
        mappings: &[Mapping],
        stream: &mut SourceStream,
    ) -> Result<()>;

    /// Global work size of entry point `stage`.
    fn global_size(&self, stage: usize) -> [usize; 2];

    /// Binds the family arguments from slot `*counter` onward.
    fn bind_global_arguments(
        &self,
        device: &dyn ComputeDevice,
        statements: &[Statement],
        kernel: &mut Kernel,
        counter: &mut u32,
    ) -> Result<()> {
        let bytes = self.base().scalar_type().size_bytes();
        for argument in self.global_arguments(statements)? {
            let value = match argument {
                GlobalArgument::Size { value, .. } => KernelArg::U32(to_u32(value)?),
                GlobalArgument::Scratch { id, len, .. } => {
                    device.write_buffer(id, &vec![0u8; len.max(1) * bytes])?;
                    KernelArg::Buffer(id)
                }
            };
            kernel.set_arg(*counter, value);
            *counter += 1;
        }
        Ok(())
    }
}

pub fn kernel_name(prefix: &str, stage: usize) -> String {
    format!("{prefix}{stage}")
}

/// Binds one family's parameters to the generation and enqueue protocol.
///
/// Transient: build one per `generate` or `enqueue` call.
pub struct KernelTemplate<'p, P> {
    parameters: &'p P,
    policy: BindingPolicy,
}

impl<'p, P: KernelFamily> KernelTemplate<'p, P> {
    pub fn new(parameters: &'p P, policy: BindingPolicy) -> Self {
        Self { parameters, policy }
    }

    pub fn parameters(&self) -> &P {
        self.parameters
    }

    pub fn policy(&self) -> BindingPolicy {
        self.policy
    }

    /// Name root shared by every entry point of the program.
    pub fn kernel_prefix(&self, statements: &[Statement]) -> String {
        statements_representation(statements, self.policy)
    }

    pub fn map(&self, statements: &[Statement]) -> Vec<Mapping> {
        map_statements(statements, self.policy, &|operand, role| {
            self.parameters.assign_width(operand, role)
        })
    }

    fn check(&self, statements: &[Statement]) -> Result<()> {
        ensure!(!statements.is_empty(), "no statements to generate a kernel for");
        let scalar_type = self.parameters.base().scalar_type();
        for statement in statements {
            ensure!(
                statement.scalar_type() == scalar_type,
                "statement on {} values cannot use {} parameters",
                statement.scalar_type(),
                scalar_type
            );
        }
        self.parameters
            .validate(statements)
            .with_context(|| format!("{} cannot generate these statements", P::FAMILY))
    }

    /// Family arguments followed by every newly bound operand argument.
    pub fn prototype(&self, statements: &[Statement], mappings: &[Mapping]) -> Result<Prototype> {
        let mut prototype = Prototype::new(self.parameters.base().scalar_type());
        self.parameters.emit_global_arguments(statements, &mut prototype)?;
        for ArgumentSlot {
            statement,
            ordinal,
            argument,
            ..
        } in argument_slots(statements, self.policy)
        {
            let (name, read_write, ty) = argument.declaration(&mappings[statement][ordinal]);
            prototype.storage(name, read_write, ty);
        }
        self.parameters.emit_workgroup_memory(statements, &mut prototype)?;
        Ok(prototype)
    }

    pub fn generate(&self, statements: &[Statement]) -> Result<String> {
        self.check(statements)?;
        let base = self.parameters.base();
        let prefix = self.kernel_prefix(statements);
        let mappings = self.map(statements);
        let prototype = self.prototype(statements, &mappings)?;

        let mut stream = SourceStream::new();
        stream.line(format!(
            "// {} simd_width={} local_size=({}, {})",
            P::FAMILY,
            base.simd_width(),
            base.local_size_0(),
            base.local_size_1()
        ));
        prototype.write(&mut stream);

        for stage in 0..base.num_kernels() {
            let mut body = SourceStream::new();
            self.parameters.emit_stage(stage, statements, &mappings, &mut body)?;

            stream.blank();
            stream.line(format!(
                "@compute @workgroup_size({}, {}, 1)",
                base.local_size_0(),
                base.local_size_1()
            ));
            stream.line(format!("fn {}({ENTRY_BUILTINS}) {{", kernel_name(&prefix, stage)));
            for line in body.as_str().lines() {
                if line.is_empty() {
                    stream.blank();
                } else {
                    stream.line(format!("  {line}"));
                }
            }
            stream.line("}");
        }

        debug!(
            family = %P::FAMILY,
            prefix = %prefix,
            stages = base.num_kernels(),
            "generated kernel source"
        );
        Ok(stream.into_string())
    }

    /// Binds arguments for every stage of `program` and submits them in order.
    pub fn enqueue(
        &self,
        device: &dyn ComputeDevice,
        program: &str,
        statements: &[Statement],
    ) -> Result<()> {
        self.check(statements)?;
        ensure!(
            !self.parameters.is_invalid(device.info()),
            "{:?} is not valid on {}",
            self.parameters,
            device.info().name
        );

        let base = self.parameters.base();
        let prefix = self.kernel_prefix(statements);
        let mut kernels = Vec::with_capacity(base.num_kernels());
        for stage in 0..base.num_kernels() {
            let mut kernel = device.kernel(program, &kernel_name(&prefix, stage))?;
            kernel.set_local_work_size(0, to_u32(base.local_size_0())?);
            kernel.set_local_work_size(1, to_u32(base.local_size_1())?);
            let global = self.parameters.global_size(stage);
            kernel.set_global_work_size(0, to_u32(global[0])?);
            kernel.set_global_work_size(1, to_u32(global[1])?);

            let mut counter = 0u32;
            self.parameters
                .bind_global_arguments(device, statements, &mut kernel, &mut counter)?;
            for slot in argument_slots(statements, self.policy) {
                kernel.set_arg(counter, slot.argument.runtime_value(&slot.operand)?);
                counter += 1;
            }
            kernels.push(kernel);
        }

        for kernel in &kernels {
            device.enqueue(kernel)?;
        }
        debug!(program, kernels = kernels.len(), "enqueued kernels");
        Ok(())
    }
}
