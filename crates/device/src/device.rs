//! The compute-device contract consumed by kernel templates and the autotuner.

use kerneltune_ir::{ResourceId, ScalarType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// PCI vendor id whose hardware schedules 64-wide wavefronts.
pub const WAVEFRONT64_VENDOR_ID: u32 = 4098;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to compile program `{program}`: {message}")]
    Compilation { program: String, message: String },
    #[error("program `{0}` has not been built")]
    ProgramNotFound(String),
    #[error("kernel `{kernel}` not found in program `{program}`")]
    KernelNotFound { program: String, kernel: String },
    #[error("resource {0} has no device storage")]
    UnknownResource(ResourceId),
    #[error("dispatch of `{kernel}` failed: {message}")]
    Dispatch { kernel: String, message: String },
    #[error("readback failed: {0}")]
    Readback(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Accelerator,
}

/// Identity used to key per-device parameter tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub vendor_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor_id: u32,
    pub kind: DeviceKind,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: [usize; 3],
    pub local_mem_size: usize,
    pub supports_f64: bool,
}

impl DeviceInfo {
    /// Minimum execution-lane grouping the hardware schedules together.
    ///
    /// Keyed off the vendor id only; other vendors with 64-wide groups are
    /// reported as 32.
    pub fn scheduling_granularity(&self) -> usize {
        if self.vendor_id == WAVEFRONT64_VENDOR_ID {
            64
        } else {
            32
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.kind == DeviceKind::Gpu
    }

    pub fn supports(&self, scalar_type: ScalarType) -> bool {
        match scalar_type {
            ScalarType::F32 => true,
            ScalarType::F64 => self.supports_f64,
        }
    }

    pub fn identity(&self) -> DeviceKey {
        DeviceKey {
            vendor_id: self.vendor_id,
            name: self.name.clone(),
        }
    }
}

/// Runtime value bound to one kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum KernelArg {
    Buffer(ResourceId),
    U32(u32),
    Scalar { value: f64, scalar_type: ScalarType },
}

impl KernelArg {
    pub fn is_buffer(&self) -> bool {
        matches!(self, KernelArg::Buffer(_))
    }

    /// Host-order bytes for by-value arguments.
    pub fn value_bytes(&self) -> Option<Vec<u8>> {
        match *self {
            KernelArg::Buffer(_) => None,
            KernelArg::U32(value) => Some(bytemuck::bytes_of(&value).to_vec()),
            KernelArg::Scalar {
                value,
                scalar_type: ScalarType::F32,
            } => Some(bytemuck::bytes_of(&(value as f32)).to_vec()),
            KernelArg::Scalar {
                value,
                scalar_type: ScalarType::F64,
            } => Some(bytemuck::bytes_of(&value).to_vec()),
        }
    }
}

/// A kernel entry point with its bound arguments and work sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    program: String,
    name: String,
    args: BTreeMap<u32, KernelArg>,
    local_size: [u32; 2],
    global_size: [u32; 2],
}

impl Kernel {
    pub fn new(program: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            name: name.into(),
            args: BTreeMap::new(),
            local_size: [1, 1],
            global_size: [1, 1],
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_arg(&mut self, index: u32, arg: KernelArg) {
        self.args.insert(index, arg);
    }

    pub fn args(&self) -> &BTreeMap<u32, KernelArg> {
        &self.args
    }

    pub fn set_local_work_size(&mut self, dim: usize, size: u32) {
        self.local_size[dim] = size;
    }

    pub fn set_global_work_size(&mut self, dim: usize, size: u32) {
        self.global_size[dim] = size;
    }

    pub fn local_work_size(&self) -> [u32; 2] {
        self.local_size
    }

    pub fn global_work_size(&self) -> [u32; 2] {
        self.global_size
    }
}

/// Program compilation, dispatch and completion for one physical device.
///
/// Implementations are driven from a single thread; methods take `&self` and
/// keep their caches behind interior mutability.
pub trait ComputeDevice {
    fn info(&self) -> &DeviceInfo;

    /// Compiles `source` under `name`. An existing program is kept unless `force`.
    fn build_program(&self, name: &str, source: &str, force: bool) -> Result<(), DeviceError>;

    fn has_program(&self, name: &str) -> bool;

    fn kernel(&self, program: &str, name: &str) -> Result<Kernel, DeviceError>;

    fn enqueue(&self, kernel: &Kernel) -> Result<(), DeviceError>;

    /// Blocks until all enqueued work has completed.
    fn finish(&self) -> Result<(), DeviceError>;

    fn write_buffer(&self, id: ResourceId, contents: &[u8]) -> Result<(), DeviceError>;

    fn read_buffer(&self, id: ResourceId) -> Result<Vec<u8>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(vendor_id: u32) -> DeviceInfo {
        DeviceInfo {
            name: "test".into(),
            vendor_id,
            kind: DeviceKind::Gpu,
            max_work_group_size: 256,
            max_work_item_sizes: [256, 256, 64],
            local_mem_size: 32 * 1024,
            supports_f64: false,
        }
    }

    #[test]
    fn granularity_depends_on_vendor() {
        assert_eq!(info(WAVEFRONT64_VENDOR_ID).scheduling_granularity(), 64);
        assert_eq!(info(0x10de).scheduling_granularity(), 32);
    }

    #[test]
    fn scalar_arguments_encode_by_type() {
        let f32_arg = KernelArg::Scalar {
            value: 1.5,
            scalar_type: ScalarType::F32,
        };
        assert_eq!(f32_arg.value_bytes(), Some(1.5f32.to_ne_bytes().to_vec()));
        assert_eq!(KernelArg::U32(7).value_bytes(), Some(7u32.to_ne_bytes().to_vec()));
        assert_eq!(KernelArg::Buffer(ResourceId(1)).value_bytes(), None);
    }
}
