//! A recording device that accepts programs and dispatches without executing them.
//!
//! Used for dry runs on machines without a GPU and for checking what the
//! generators bind to each argument slot.

use crate::device::{
    ComputeDevice, DeviceError, DeviceInfo, DeviceKind, Kernel, KernelArg, WAVEFRONT64_VENDOR_ID,
};
use crate::planner::DispatchPlan;
use kerneltune_ir::ResourceId;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

type CompileHook = Box<dyn Fn(&str, &str) -> Option<String>>;

/// One recorded kernel submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub program: String,
    pub kernel: String,
    pub local_size: [u32; 2],
    pub global_size: [u32; 2],
    pub workgroups: [u32; 3],
    pub args: BTreeMap<u32, KernelArg>,
}

#[derive(Debug, Clone)]
struct SimulatedProgram {
    source: String,
    entry_points: Vec<String>,
}

pub struct SimulatedDevice {
    info: DeviceInfo,
    programs: RefCell<HashMap<String, SimulatedProgram>>,
    buffers: RefCell<HashMap<ResourceId, Vec<u8>>>,
    dispatches: RefCell<Vec<Dispatch>>,
    builds: RefCell<usize>,
    finishes: RefCell<usize>,
    compile_hook: Option<CompileHook>,
}

impl SimulatedDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            programs: RefCell::new(HashMap::new()),
            buffers: RefCell::new(HashMap::new()),
            dispatches: RefCell::new(Vec::new()),
            builds: RefCell::new(0),
            finishes: RefCell::new(0),
            compile_hook: None,
        }
    }

    /// A discrete GPU with 32-wide scheduling and common desktop limits.
    pub fn gpu() -> Self {
        Self::new(DeviceInfo {
            name: "Simulated GPU".into(),
            vendor_id: 0x10de,
            kind: DeviceKind::Gpu,
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 64],
            local_mem_size: 48 * 1024,
            supports_f64: true,
        })
    }

    /// A GPU reporting the 64-wide wavefront vendor id.
    pub fn wavefront64_gpu() -> Self {
        Self::new(DeviceInfo {
            name: "Simulated Wavefront GPU".into(),
            vendor_id: WAVEFRONT64_VENDOR_ID,
            kind: DeviceKind::Gpu,
            max_work_group_size: 256,
            max_work_item_sizes: [256, 256, 256],
            local_mem_size: 32 * 1024,
            supports_f64: true,
        })
    }

    pub fn cpu() -> Self {
        Self::new(DeviceInfo {
            name: "Simulated CPU".into(),
            vendor_id: 0x8086,
            kind: DeviceKind::Cpu,
            max_work_group_size: 8192,
            max_work_item_sizes: [8192, 8192, 8192],
            local_mem_size: 32 * 1024,
            supports_f64: true,
        })
    }

    /// Fails compilation whenever `hook(program, source)` returns a message.
    pub fn with_compile_hook(
        mut self,
        hook: impl Fn(&str, &str) -> Option<String> + 'static,
    ) -> Self {
        self.compile_hook = Some(Box::new(hook));
        self
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.borrow().clone()
    }

    pub fn clear_dispatches(&self) {
        self.dispatches.borrow_mut().clear();
    }

    pub fn build_count(&self) -> usize {
        *self.builds.borrow()
    }

    pub fn finish_count(&self) -> usize {
        *self.finishes.borrow()
    }

    pub fn program_source(&self, name: &str) -> Option<String> {
        self.programs
            .borrow()
            .get(name)
            .map(|program| program.source.clone())
    }
}

/// Names of `@compute` entry points declared in a WGSL module.
pub fn compute_entry_points(source: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut pending_compute = false;
    for line in source.lines().map(str::trim) {
        if line.starts_with("@compute") {
            pending_compute = true;
        }
        if let Some(rest) = line.strip_prefix("fn ") {
            if pending_compute {
                let name: String = rest
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                    .collect();
                entries.push(name);
            }
            pending_compute = false;
        }
    }
    entries
}

impl ComputeDevice for SimulatedDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_program(&self, name: &str, source: &str, force: bool) -> Result<(), DeviceError> {
        if !force && self.has_program(name) {
            return Ok(());
        }
        if let Some(message) = self.compile_hook.as_ref().and_then(|hook| hook(name, source)) {
            return Err(DeviceError::Compilation {
                program: name.to_string(),
                message,
            });
        }

        let entry_points = compute_entry_points(source);
        debug!(program = name, entries = entry_points.len(), "simulated program built");
        *self.builds.borrow_mut() += 1;
        self.programs.borrow_mut().insert(
            name.to_string(),
            SimulatedProgram {
                source: source.to_string(),
                entry_points,
            },
        );
        Ok(())
    }

    fn has_program(&self, name: &str) -> bool {
        self.programs.borrow().contains_key(name)
    }

    fn kernel(&self, program: &str, name: &str) -> Result<Kernel, DeviceError> {
        let programs = self.programs.borrow();
        let built = programs
            .get(program)
            .ok_or_else(|| DeviceError::ProgramNotFound(program.to_string()))?;
        if !built.entry_points.iter().any(|entry| entry == name) {
            return Err(DeviceError::KernelNotFound {
                program: program.to_string(),
                kernel: name.to_string(),
            });
        }
        Ok(Kernel::new(program, name))
    }

    fn enqueue(&self, kernel: &Kernel) -> Result<(), DeviceError> {
        let plan = DispatchPlan::for_kernel(kernel)?;
        let buffers = self.buffers.borrow();
        for arg in kernel.args().values() {
            if let KernelArg::Buffer(id) = arg {
                if !buffers.contains_key(id) {
                    return Err(DeviceError::UnknownResource(*id));
                }
            }
        }
        self.dispatches.borrow_mut().push(Dispatch {
            program: kernel.program().to_string(),
            kernel: kernel.name().to_string(),
            local_size: kernel.local_work_size(),
            global_size: kernel.global_work_size(),
            workgroups: plan.workgroups,
            args: kernel.args().clone(),
        });
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        *self.finishes.borrow_mut() += 1;
        Ok(())
    }

    fn write_buffer(&self, id: ResourceId, contents: &[u8]) -> Result<(), DeviceError> {
        self.buffers.borrow_mut().insert(id, contents.to_vec());
        Ok(())
    }

    fn read_buffer(&self, id: ResourceId) -> Result<Vec<u8>, DeviceError> {
        self.buffers
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(DeviceError::UnknownResource(id))
    }
}
