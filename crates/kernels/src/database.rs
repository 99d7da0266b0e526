//! Per-device default parameters for each family.

use crate::params::FamilyParameters;
use kerneltune_device::{DeviceInfo, DeviceKey, DeviceKind};
use kerneltune_ir::ScalarType;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Parameter lookup keyed by device identity and scalar width.
///
/// Lookups try the exact device, then its device kind, then the family
/// fallback. Entries invalid on the querying device are skipped.
#[derive(Debug, Clone)]
pub struct Database<P> {
    devices: HashMap<(DeviceKey, usize), P>,
    kinds: HashMap<(DeviceKind, usize), P>,
}

impl<P> Default for Database<P> {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            kinds: HashMap::new(),
        }
    }
}

impl<P: FamilyParameters> Database<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables shipped with the family.
    pub fn builtin() -> Self {
        let mut database = Self::new();
        for (kind, scalar_type, params) in P::builtin_entries() {
            database.insert_kind(kind, scalar_type, params);
        }
        database
    }

    pub fn insert(&mut self, device: DeviceKey, scalar_type: ScalarType, params: P) {
        self.devices
            .insert((device, scalar_type.size_bytes()), params);
    }

    pub fn insert_kind(&mut self, kind: DeviceKind, scalar_type: ScalarType, params: P) {
        self.kinds.insert((kind, scalar_type.size_bytes()), params);
    }

    pub fn get(&self, device: &DeviceInfo, scalar_type: ScalarType) -> P {
        let bytes = scalar_type.size_bytes();
        let candidates = [
            ("device", self.devices.get(&(device.identity(), bytes))),
            ("kind", self.kinds.get(&(device.kind, bytes))),
        ];
        for (source, params) in candidates {
            let Some(params) = params else { continue };
            if params.is_invalid(device) {
                warn!(
                    family = %P::FAMILY,
                    device = %device.name,
                    source,
                    "stored parameters are invalid on this device; skipping"
                );
                continue;
            }
            debug!(family = %P::FAMILY, device = %device.name, source, "parameters found");
            return params.clone();
        }
        P::fallback(scalar_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::families::{ReductionParameters, VectorAxpyParameters};
    use kerneltune_device::{ComputeDevice, SimulatedDevice};

    #[test]
    fn exact_device_wins_over_kind() {
        let device = SimulatedDevice::gpu();
        let info = device.info();
        let mut database = Database::<VectorAxpyParameters>::builtin();
        let tuned = VectorAxpyParameters::new(ScalarType::F32, 4, 256, 64);
        database.insert(info.identity(), ScalarType::F32, tuned);

        assert_eq!(database.get(info, ScalarType::F32), tuned);
        assert_eq!(
            database.get(info, ScalarType::F64),
            VectorAxpyParameters::new(ScalarType::F64, 1, 128, 128)
        );
    }

    #[test]
    fn invalid_entries_fall_through() {
        let device = SimulatedDevice::wavefront64_gpu();
        let info = device.info();
        let mut database = Database::<ReductionParameters>::new();
        // 32 is not a multiple of the 64-wide wavefront.
        database.insert(
            info.identity(),
            ScalarType::F32,
            ReductionParameters::new(ScalarType::F32, 1, 32, 16),
        );
        assert_eq!(
            database.get(info, ScalarType::F32),
            ReductionParameters::fallback(ScalarType::F32)
        );
    }

    #[test]
    fn builtin_entries_are_valid_on_matching_devices() {
        let gpu = SimulatedDevice::gpu();
        let cpu = SimulatedDevice::cpu();
        for (kind, _, params) in VectorAxpyParameters::builtin_entries() {
            let device = if kind == DeviceKind::Gpu { &gpu } else { &cpu };
            assert!(!params.is_invalid(device.info()), "{params:?}");
        }
    }
}
