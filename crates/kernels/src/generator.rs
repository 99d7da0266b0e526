//! Program naming, on-demand compilation and execution against one device.

use crate::database::Database;
use crate::template::{KernelFamily, KernelTemplate};
use anyhow::{ensure, Result};
use kerneltune_device::ComputeDevice;
use kerneltune_ir::{BindingPolicy, Statement};
use tracing::{debug, info};

/// Suffix of programs compiled from explicitly forced parameters.
const FORCED_SUFFIX: &str = "_forced";

/// Generation context for one device and binding policy.
///
/// Program names carry the parameter values the source was generated from,
/// so a cached program is only reused for the exact same parameters.
/// Programs built from forced parameters additionally live under their own
/// names and never shadow a cached default program.
pub struct Generator<'d> {
    device: &'d dyn ComputeDevice,
    policy: BindingPolicy,
}

impl<'d> Generator<'d> {
    pub fn new(device: &'d dyn ComputeDevice, policy: BindingPolicy) -> Self {
        Self { device, policy }
    }

    pub fn device(&self) -> &'d dyn ComputeDevice {
        self.device
    }

    pub fn policy(&self) -> BindingPolicy {
        self.policy
    }

    pub fn program_name<P: KernelFamily>(
        &self,
        params: &P,
        statements: &[Statement],
        forced: bool,
    ) -> String {
        let prefix = KernelTemplate::new(params, self.policy).kernel_prefix(statements);
        let fingerprint = params.csv_row().replace(',', "_");
        let suffix = if forced { FORCED_SUFFIX } else { "" };
        format!("{}_{prefix}_{fingerprint}{suffix}", P::FAMILY)
    }

    /// Builds the program for `params` unless a cached copy may be reused.
    ///
    /// `forced` regenerates and rebuilds under the forced program name.
    pub fn compile<P: KernelFamily>(
        &self,
        params: &P,
        statements: &[Statement],
        forced: bool,
    ) -> Result<String> {
        let info = self.device.info();
        ensure!(
            !params.is_invalid(info),
            "{params:?} is not valid on {}",
            info.name
        );
        let program = self.program_name(params, statements, forced);
        if !forced && self.device.has_program(&program) {
            debug!(program = %program, "reusing compiled program");
            return Ok(program);
        }
        let source = KernelTemplate::new(params, self.policy).generate(statements)?;
        self.device.build_program(&program, &source, forced)?;
        debug!(program = %program, forced, bytes = source.len(), "compiled program");
        Ok(program)
    }

    pub fn enqueue<P: KernelFamily>(
        &self,
        params: &P,
        program: &str,
        statements: &[Statement],
    ) -> Result<()> {
        KernelTemplate::new(params, self.policy).enqueue(self.device, program, statements)
    }

    /// Runs `statements` with the database parameters for this device.
    pub fn execute<P: KernelFamily>(
        &self,
        database: &Database<P>,
        statements: &[Statement],
    ) -> Result<P> {
        ensure!(!statements.is_empty(), "no statements to execute");
        let params = database.get(self.device.info(), statements[0].scalar_type());
        let program = self.compile(&params, statements, false)?;
        self.enqueue(&params, &program, statements)?;
        Ok(params)
    }

    /// Runs `statements` with `params`, rebuilding the forced program.
    pub fn execute_with<P: KernelFamily>(
        &self,
        params: &P,
        statements: &[Statement],
    ) -> Result<()> {
        let program = self.compile(params, statements, true)?;
        info!(
            family = %P::FAMILY,
            program = %program,
            params = %params.csv_row(),
            "executing with forced parameters"
        );
        self.enqueue(params, &program, statements)
    }
}
