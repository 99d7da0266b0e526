//! Persisted best parameters from past sweeps.

use anyhow::{Context, Result};
use kerneltune_device::{DeviceInfo, DeviceKey};
use kerneltune_ir::ScalarType;
use kerneltune_kernels::{Database, Family, FamilyParameters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedProfile {
    pub device: DeviceKey,
    pub family: Family,
    pub scalar_type: ScalarType,
    /// Seconds per enqueue when the profile was measured.
    pub time: f64,
    pub params: serde_json::Value,
}

/// Fastest known parameters per device, family and scalar type.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TuningCache {
    profiles: BTreeMap<String, CachedProfile>,
}

impl TuningCache {
    pub fn new() -> Self {
        Self {
            profiles: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Stores `params` unless a faster profile is already cached.
    ///
    /// Returns whether the cache changed.
    pub fn record<P: FamilyParameters>(
        &mut self,
        device: &DeviceInfo,
        time: f64,
        params: &P,
    ) -> Result<bool> {
        let scalar_type = params.base().scalar_type();
        let key = profile_key(&device.identity(), P::FAMILY, scalar_type);
        if let Some(existing) = self.profiles.get(&key) {
            if existing.time <= time {
                return Ok(false);
            }
        }
        let profile = CachedProfile {
            device: device.identity(),
            family: P::FAMILY,
            scalar_type,
            time,
            params: serde_json::to_value(params)?,
        };
        debug!(key = %key, time, "caching tuned parameters");
        self.profiles.insert(key, profile);
        Ok(true)
    }

    pub fn get<P: FamilyParameters>(
        &self,
        device: &DeviceInfo,
        scalar_type: ScalarType,
    ) -> Result<Option<(f64, P)>> {
        let key = profile_key(&device.identity(), P::FAMILY, scalar_type);
        match self.profiles.get(&key) {
            Some(profile) => Ok(Some((profile.time, decode(profile)?))),
            None => Ok(None),
        }
    }

    /// Inserts every cached profile of `P`'s family into `database`.
    pub fn apply_to<P: FamilyParameters>(&self, database: &mut Database<P>) -> Result<usize> {
        let mut applied = 0;
        for profile in self.profiles.values() {
            if profile.family != P::FAMILY {
                continue;
            }
            let params: P = decode(profile)?;
            database.insert(profile.device.clone(), profile.scalar_type, params);
            applied += 1;
        }
        Ok(applied)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = fs::read(path)?;
        let cache = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse tuning cache {}", path.display()))?;
        Ok(cache)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }
}

fn profile_key(device: &DeviceKey, family: Family, scalar_type: ScalarType) -> String {
    format!(
        "{:04x}:{}:{family}:{scalar_type}",
        device.vendor_id, device.name
    )
}

fn decode<P: FamilyParameters>(profile: &CachedProfile) -> Result<P> {
    serde_json::from_value(profile.params.clone())
        .with_context(|| format!("cached {} parameters are malformed", profile.family))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use kerneltune_device::{ComputeDevice, SimulatedDevice};
    use kerneltune_kernels::{ReductionParameters, VectorAxpyParameters};

    #[test]
    fn keeps_the_faster_profile() {
        let device = SimulatedDevice::gpu();
        let mut cache = TuningCache::new();
        let slow = VectorAxpyParameters::new(ScalarType::F32, 1, 64, 8);
        let fast = VectorAxpyParameters::new(ScalarType::F32, 4, 256, 32);

        assert!(cache.record(device.info(), 2.0e-4, &slow).unwrap());
        assert!(cache.record(device.info(), 1.0e-4, &fast).unwrap());
        assert!(!cache.record(device.info(), 3.0e-4, &slow).unwrap());

        let (time, params) = cache
            .get::<VectorAxpyParameters>(device.info(), ScalarType::F32)
            .unwrap()
            .unwrap();
        assert_relative_eq!(time, 1.0e-4);
        assert_eq!(params, fast);
        assert!(cache
            .get::<ReductionParameters>(device.info(), ScalarType::F32)
            .unwrap()
            .is_none());
    }

    #[test]
    fn cached_profiles_feed_the_database() {
        let device = SimulatedDevice::gpu();
        let mut cache = TuningCache::new();
        let tuned = ReductionParameters::new(ScalarType::F32, 2, 512, 16);
        cache.record(device.info(), 1.0e-3, &tuned).unwrap();
        cache
            .record(
                device.info(),
                1.0e-3,
                &VectorAxpyParameters::new(ScalarType::F32, 1, 64, 8),
            )
            .unwrap();

        let mut database = Database::<ReductionParameters>::builtin();
        assert_eq!(cache.apply_to(&mut database).unwrap(), 1);
        assert_eq!(database.get(device.info(), ScalarType::F32), tuned);
    }

    #[test]
    fn survives_a_round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("kerneltune-cache-{}", std::process::id()));
        let path = dir.join("tuning.json");
        let device = SimulatedDevice::cpu();
        let mut cache = TuningCache::new();
        cache
            .record(
                device.info(),
                5.0e-5,
                &VectorAxpyParameters::new(ScalarType::F64, 4, 16, 64),
            )
            .unwrap();
        cache.save_to_file(&path).unwrap();

        let loaded = TuningCache::load_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(TuningCache::load_from_file(&dir.join("missing.json"))
            .unwrap()
            .is_empty());
        fs::remove_dir_all(&dir).unwrap();
    }
}
