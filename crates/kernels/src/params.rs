//! Execution-shape parameters shared by every kernel family.

use anyhow::{bail, Result};
use kerneltune_device::{DeviceInfo, DeviceKind};
use kerneltune_ir::ScalarType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Data-parallel widths a kernel may be generated with.
pub const LEGAL_SIMD_WIDTHS: [usize; 5] = [1, 2, 4, 8, 16];

/// Operation families with a kernel template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    VectorAxpy,
    MatrixAxpy,
    Reduction,
    RowWiseReduction,
}

impl Family {
    pub const ALL: [Family; 4] = [
        Family::VectorAxpy,
        Family::MatrixAxpy,
        Family::Reduction,
        Family::RowWiseReduction,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Family::VectorAxpy => "vector_axpy",
            Family::MatrixAxpy => "matrix_axpy",
            Family::Reduction => "reduction",
            Family::RowWiseReduction => "row_wise_reduction",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Family {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match Family::ALL.into_iter().find(|family| family.name() == s) {
            Some(family) => Ok(family),
            None => bail!(
                "unknown kernel family `{s}` (expected one of {})",
                Family::ALL.map(|family| family.name()).join(", ")
            ),
        }
    }
}

/// Immutable execution-shape descriptor common to all families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterSet {
    scalar_type: ScalarType,
    simd_width: usize,
    local_size_0: usize,
    local_size_1: usize,
    num_kernels: usize,
}

impl ParameterSet {
    pub fn new(
        scalar_type: ScalarType,
        simd_width: usize,
        local_size_0: usize,
        local_size_1: usize,
        num_kernels: usize,
    ) -> Self {
        Self {
            scalar_type,
            simd_width,
            local_size_0,
            local_size_1,
            num_kernels,
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    pub fn simd_width(&self) -> usize {
        self.simd_width
    }

    pub fn local_size_0(&self) -> usize {
        self.local_size_0
    }

    pub fn local_size_1(&self) -> usize {
        self.local_size_1
    }

    pub fn num_kernels(&self) -> usize {
        self.num_kernels
    }

    /// Flattened work-group size, `None` when it overflows.
    pub fn work_group_size(&self) -> Option<usize> {
        self.local_size_0.checked_mul(self.local_size_1)
    }

    /// Device checks that do not depend on the family.
    ///
    /// `local_memory_bytes` is the family's estimate for this set.
    pub fn is_invalid(&self, device: &DeviceInfo, local_memory_bytes: usize) -> bool {
        let Some(group_size) = self.work_group_size() else {
            return true;
        };
        local_memory_bytes > device.local_mem_size
            || group_size == 0
            || group_size > device.max_work_group_size
            || self.local_size_0 > device.max_work_item_sizes[0]
            || self.local_size_1 > device.max_work_item_sizes[1]
            || (device.is_gpu() && group_size % device.scheduling_granularity() != 0)
            || !LEGAL_SIMD_WIDTHS.contains(&self.simd_width)
            || !device.supports(self.scalar_type)
            || self.num_kernels == 0
    }

    fn csv_header() -> &'static str {
        "scalar_bytes,simd_width,local_size_0,local_size_1,num_kernels"
    }

    fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.scalar_type.size_bytes(),
            self.simd_width,
            self.local_size_0,
            self.local_size_1,
            self.num_kernels
        )
    }
}

/// Parameters of one kernel family: a [`ParameterSet`] plus family fields.
pub trait FamilyParameters: Clone + fmt::Debug + Serialize + serde::de::DeserializeOwned {
    const FAMILY: Family;

    fn base(&self) -> &ParameterSet;

    /// Workgroup memory the generated kernel allocates.
    fn local_memory_bytes(&self) -> usize {
        0
    }

    /// Family-specific invalidity on top of the common checks.
    fn invalid_impl(&self, _device: &DeviceInfo) -> bool {
        false
    }

    fn is_invalid(&self, device: &DeviceInfo) -> bool {
        self.base().is_invalid(device, self.local_memory_bytes()) || self.invalid_impl(device)
    }

    /// Family fields after the common ones, as `(column, value)` pairs.
    fn extra_fields(&self) -> Vec<(&'static str, usize)> {
        Vec::new()
    }

    fn csv_header(&self) -> String {
        let mut header = ParameterSet::csv_header().to_string();
        for (name, _) in self.extra_fields() {
            header.push(',');
            header.push_str(name);
        }
        header
    }

    fn csv_row(&self) -> String {
        let mut row = self.base().csv_row();
        for (_, value) in self.extra_fields() {
            row.push(',');
            row.push_str(&value.to_string());
        }
        row
    }

    /// Last-resort parameters when no table has an entry.
    fn fallback(scalar_type: ScalarType) -> Self;

    /// Built-in per-device-kind defaults.
    fn builtin_entries() -> Vec<(DeviceKind, ScalarType, Self)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(max_work_group_size: usize, vendor_id: u32) -> DeviceInfo {
        DeviceInfo {
            name: "test gpu".into(),
            vendor_id,
            kind: DeviceKind::Gpu,
            max_work_group_size,
            max_work_item_sizes: [1024, 1024, 64],
            local_mem_size: 32 * 1024,
            supports_f64: false,
        }
    }

    fn cpu() -> DeviceInfo {
        DeviceInfo {
            kind: DeviceKind::Cpu,
            max_work_group_size: 8192,
            max_work_item_sizes: [8192, 8192, 8192],
            ..gpu(8192, 0x8086)
        }
    }

    #[test]
    fn flattened_size_is_bounded_even_when_each_dimension_fits() {
        let params = ParameterSet::new(ScalarType::F32, 1, 1024, 1024, 1);
        let device = gpu(1024, 0x10de);
        assert!(params.is_invalid(&device, 0));
    }

    #[test]
    fn illegal_width_is_invalid_everywhere() {
        let params = ParameterSet::new(ScalarType::F32, 3, 64, 1, 1);
        assert!(params.is_invalid(&gpu(1024, 0x10de), 0));
        assert!(params.is_invalid(&cpu(), 0));
    }

    #[test]
    fn misaligned_group_on_gpu_is_invalid() {
        let params = ParameterSet::new(ScalarType::F32, 1, 10, 1, 1);
        let device = gpu(1024, 0x10de);
        assert_eq!(device.scheduling_granularity(), 32);
        assert!(params.is_invalid(&device, 0));
        assert!(!params.is_invalid(&cpu(), 0));
    }

    #[test]
    fn wavefront_vendor_needs_multiples_of_64() {
        let params = ParameterSet::new(ScalarType::F32, 1, 32, 1, 1);
        assert!(!params.is_invalid(&gpu(1024, 0x10de), 0));
        assert!(params.is_invalid(&gpu(1024, kerneltune_device::WAVEFRONT64_VENDOR_ID), 0));
    }

    #[test]
    fn local_memory_and_scalar_support_are_checked() {
        let device = gpu(1024, 0x10de);
        let params = ParameterSet::new(ScalarType::F32, 1, 64, 1, 1);
        assert!(!params.is_invalid(&device, 32 * 1024));
        assert!(params.is_invalid(&device, 32 * 1024 + 1));

        let doubles = ParameterSet::new(ScalarType::F64, 1, 64, 1, 1);
        assert!(doubles.is_invalid(&device, 0));
    }

    #[test]
    fn validity_is_a_pure_query() {
        let device = gpu(256, 0x10de);
        let params = ParameterSet::new(ScalarType::F32, 4, 128, 2, 1);
        let first = params.is_invalid(&device, 512);
        for _ in 0..4 {
            assert_eq!(params.is_invalid(&device, 512), first);
        }
    }

    #[test]
    fn overflowing_work_group_is_invalid() {
        let params = ParameterSet::new(ScalarType::F32, 1, usize::MAX / 2, 4, 1);
        assert_eq!(params.work_group_size(), None);
        assert!(params.is_invalid(&cpu(), 0));
    }

    #[test]
    fn family_names_round_trip() {
        for family in Family::ALL {
            assert_eq!(family.name().parse::<Family>().unwrap(), family);
        }
        assert!("gemm".parse::<Family>().is_err());
    }

    #[test]
    fn family_serializes_with_its_name() {
        for family in Family::ALL {
            let json = serde_json::to_string(&family).unwrap();
            assert_eq!(json, format!("\"{}\"", family.name()));
            assert_eq!(serde_json::from_str::<Family>(&json).unwrap(), family);
        }
    }
}
