//! Enumerable tuning axes and per-family search spaces.

use anyhow::{anyhow, ensure, Result};
use kerneltune_device::DeviceInfo;
use kerneltune_ir::ScalarType;
use kerneltune_kernels::{
    KernelFamily, MatrixAxpyParameters, ReductionParameters, RowWiseReductionParameters,
    VectorAxpyParameters,
};
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// One axis of the search space: candidate values and a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningParameter {
    values: Vec<usize>,
    current: usize,
}

impl TuningParameter {
    pub fn new(values: Vec<usize>) -> Result<Self> {
        ensure!(!values.is_empty(), "a tuning parameter needs at least one value");
        Ok(Self { values, current: 0 })
    }

    pub fn values(&self) -> &[usize] {
        &self.values
    }

    pub fn current(&self) -> usize {
        self.values[self.current]
    }

    pub fn is_max(&self) -> bool {
        self.current == self.values.len() - 1
    }

    /// Advances the cursor; returns `true` when it wrapped back to the start.
    pub fn increment(&mut self) -> bool {
        self.current += 1;
        if self.current < self.values.len() {
            return false;
        }
        self.reset();
        true
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }
}

/// Current value of every axis, by name.
pub type AxisValues = BTreeMap<String, usize>;

pub(crate) fn axis(values: &AxisValues, name: &str) -> Result<usize> {
    values
        .get(name)
        .copied()
        .ok_or_else(|| anyhow!("tuning axis `{name}` is not configured"))
}

/// A family whose parameters can be synthesised from axis values.
pub trait Tunable: KernelFamily {
    /// Axis names and candidates searched when nothing is overridden.
    fn default_space() -> Vec<(&'static str, Vec<usize>)>;

    fn from_axes(scalar_type: ScalarType, axes: &AxisValues) -> Result<Self>;
}

impl Tunable for VectorAxpyParameters {
    fn default_space() -> Vec<(&'static str, Vec<usize>)> {
        vec![
            ("simd_width", vec![1, 2, 4, 8]),
            ("local_size_0", vec![64, 128, 256, 512]),
            ("num_groups", vec![16, 32, 64, 128, 256]),
        ]
    }

    fn from_axes(scalar_type: ScalarType, axes: &AxisValues) -> Result<Self> {
        Ok(Self::new(
            scalar_type,
            axis(axes, "simd_width")?,
            axis(axes, "local_size_0")?,
            axis(axes, "num_groups")?,
        ))
    }
}

impl Tunable for MatrixAxpyParameters {
    fn default_space() -> Vec<(&'static str, Vec<usize>)> {
        vec![
            ("simd_width", vec![1, 2, 4]),
            ("local_size_0", vec![8, 16, 32]),
            ("local_size_1", vec![4, 8, 16, 32]),
            ("num_groups_0", vec![8, 16, 32]),
            ("num_groups_1", vec![8, 16, 32]),
        ]
    }

    fn from_axes(scalar_type: ScalarType, axes: &AxisValues) -> Result<Self> {
        Ok(Self::new(
            scalar_type,
            axis(axes, "simd_width")?,
            axis(axes, "local_size_0")?,
            axis(axes, "local_size_1")?,
            axis(axes, "num_groups_0")?,
            axis(axes, "num_groups_1")?,
        ))
    }
}

impl Tunable for ReductionParameters {
    fn default_space() -> Vec<(&'static str, Vec<usize>)> {
        vec![
            ("simd_width", vec![1, 2, 4, 8]),
            ("local_size_0", vec![64, 128, 256, 512]),
            ("num_groups", vec![32, 64, 128, 256]),
        ]
    }

    fn from_axes(scalar_type: ScalarType, axes: &AxisValues) -> Result<Self> {
        Ok(Self::new(
            scalar_type,
            axis(axes, "simd_width")?,
            axis(axes, "local_size_0")?,
            axis(axes, "num_groups")?,
        ))
    }
}

impl Tunable for RowWiseReductionParameters {
    fn default_space() -> Vec<(&'static str, Vec<usize>)> {
        vec![
            ("simd_width", vec![1, 2, 4]),
            ("local_size_0", vec![1, 2, 4, 8]),
            ("local_size_1", vec![16, 32, 64, 128]),
            ("num_groups_0", vec![32, 64, 128, 256]),
        ]
    }

    fn from_axes(scalar_type: ScalarType, axes: &AxisValues) -> Result<Self> {
        Ok(Self::new(
            scalar_type,
            axis(axes, "simd_width")?,
            axis(axes, "local_size_0")?,
            axis(axes, "local_size_1")?,
            axis(axes, "num_groups_0")?,
        ))
    }
}

/// Named axes enumerated as a mixed-radix odometer.
///
/// Axes advance in name order, the first name fastest. From a reset, the
/// reset combination plus one combination per `update()` until `has_next()`
/// turns false covers the full Cartesian product exactly once.
#[derive(Debug, Clone)]
pub struct TuningConfiguration<P> {
    scalar_type: ScalarType,
    axes: BTreeMap<String, TuningParameter>,
    family: PhantomData<P>,
}

impl<P: Tunable> TuningConfiguration<P> {
    /// A configuration with no axes.
    pub fn empty(scalar_type: ScalarType) -> Self {
        Self {
            scalar_type,
            axes: BTreeMap::new(),
            family: PhantomData,
        }
    }

    /// The family's default search space.
    pub fn new(scalar_type: ScalarType) -> Self {
        let mut configuration = Self::empty(scalar_type);
        for (name, values) in P::default_space() {
            configuration.axes.insert(
                name.to_string(),
                TuningParameter {
                    values,
                    current: 0,
                },
            );
        }
        configuration
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    /// Adds an axis, replacing any axis of the same name.
    pub fn add_tuning_param(&mut self, name: impl Into<String>, values: Vec<usize>) -> Result<()> {
        let name = name.into();
        let parameter =
            TuningParameter::new(values).map_err(|err| anyhow!("axis `{name}`: {err}"))?;
        self.axes.insert(name, parameter);
        Ok(())
    }

    pub fn axis_names(&self) -> impl Iterator<Item = &str> {
        self.axes.keys().map(String::as_str)
    }

    /// Size of the Cartesian product of all axes.
    pub fn combinations(&self) -> usize {
        self.axes.values().map(|axis| axis.values().len()).product()
    }

    pub fn has_next(&self) -> bool {
        self.axes.values().any(|axis| !axis.is_max())
    }

    /// Advances to the next combination.
    pub fn update(&mut self) {
        for axis in self.axes.values_mut() {
            if !axis.increment() {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        for axis in self.axes.values_mut() {
            axis.reset();
        }
    }

    pub fn current_values(&self) -> AxisValues {
        self.axes
            .iter()
            .map(|(name, axis)| (name.clone(), axis.current()))
            .collect()
    }

    /// Whether the current combination cannot run on `device`.
    ///
    /// Combinations that do not materialise are invalid too.
    pub fn is_invalid(&self, device: &DeviceInfo) -> bool {
        match self.get_current() {
            Ok(params) => params.is_invalid(device),
            Err(_) => true,
        }
    }

    pub fn get_current(&self) -> Result<P> {
        P::from_axes(self.scalar_type, &self.current_values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kerneltune_device::{ComputeDevice, SimulatedDevice};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn sweep<P: Tunable>(configuration: &mut TuningConfiguration<P>) -> Vec<AxisValues> {
        configuration.reset();
        let mut seen = vec![configuration.current_values()];
        while configuration.has_next() {
            configuration.update();
            seen.push(configuration.current_values());
        }
        seen
    }

    #[test]
    fn increment_carries_and_resets() {
        let mut parameter = TuningParameter::new(vec![16, 32]).unwrap();
        assert_eq!(parameter.current(), 16);
        assert!(!parameter.increment());
        assert!(parameter.is_max());
        assert!(parameter.increment());
        assert_eq!(parameter.current(), 16);
        assert!(TuningParameter::new(Vec::new()).is_err());
    }

    #[test]
    fn two_axes_enumerate_nine_combinations() {
        let mut configuration = TuningConfiguration::<MatrixAxpyParameters>::empty(ScalarType::F32);
        configuration.add_tuning_param("L0", vec![16, 32, 64]).unwrap();
        configuration.add_tuning_param("L1", vec![1, 2, 4]).unwrap();

        let seen = sweep(&mut configuration);
        assert_eq!(seen.len(), 9);
        let distinct: HashSet<Vec<usize>> = seen
            .iter()
            .map(|values| values.values().copied().collect())
            .collect();
        assert_eq!(distinct.len(), 9);
        // First axis by name moves fastest.
        assert_eq!(seen[1]["L0"], 32);
        assert_eq!(seen[1]["L1"], 1);
    }

    #[test]
    fn empty_axes_are_rejected() {
        let mut configuration = TuningConfiguration::<VectorAxpyParameters>::new(ScalarType::F32);
        assert!(configuration.add_tuning_param("num_groups", Vec::new()).is_err());
    }

    #[test]
    fn get_current_does_not_advance() {
        let mut configuration = TuningConfiguration::<ReductionParameters>::new(ScalarType::F32);
        configuration.update();
        let first = configuration.get_current().unwrap();
        assert_eq!(configuration.get_current().unwrap(), first);
        assert_eq!(first, ReductionParameters::new(ScalarType::F32, 1, 128, 32));
    }

    #[test]
    fn missing_axes_make_combinations_invalid() {
        let device = SimulatedDevice::gpu();
        let mut configuration =
            TuningConfiguration::<RowWiseReductionParameters>::empty(ScalarType::F32);
        configuration.add_tuning_param("simd_width", vec![1]).unwrap();
        assert!(configuration.get_current().is_err());
        assert!(configuration.is_invalid(device.info()));
    }

    #[test]
    fn oversized_axis_values_are_invalid() {
        let device = SimulatedDevice::cpu();
        let mut configuration =
            TuningConfiguration::<MatrixAxpyParameters>::new(ScalarType::F32);
        configuration
            .add_tuning_param("local_size_1", vec![usize::MAX])
            .unwrap();
        configuration
            .add_tuning_param("num_groups_0", vec![usize::MAX / 2])
            .unwrap();
        configuration.reset();
        loop {
            assert!(configuration.is_invalid(device.info()));
            if !configuration.has_next() {
                break;
            }
            configuration.update();
        }
    }

    #[test]
    fn default_spaces_materialise() {
        let device = SimulatedDevice::gpu();
        let mut vector = TuningConfiguration::<VectorAxpyParameters>::new(ScalarType::F32);
        assert_eq!(sweep(&mut vector).len(), vector.combinations());
        let valid = {
            vector.reset();
            let mut valid = usize::from(!vector.is_invalid(device.info()));
            while vector.has_next() {
                vector.update();
                valid += usize::from(!vector.is_invalid(device.info()));
            }
            valid
        };
        assert!(valid > 0 && valid <= vector.combinations());
    }

    proptest! {
        #[test]
        fn odometer_visits_every_combination_once(
            cardinalities in proptest::collection::vec(1usize..5, 1..5)
        ) {
            let mut configuration =
                TuningConfiguration::<VectorAxpyParameters>::empty(ScalarType::F32);
            for (index, count) in cardinalities.iter().enumerate() {
                configuration
                    .add_tuning_param(format!("axis{index}"), (0..*count).collect())
                    .unwrap();
            }
            let expected: usize = cardinalities.iter().product();

            configuration.reset();
            let mut seen = HashSet::new();
            seen.insert(configuration.current_values());
            let mut updates = 0;
            while configuration.has_next() {
                configuration.update();
                updates += 1;
                prop_assert!(seen.insert(configuration.current_values()));
            }
            prop_assert_eq!(seen.len(), expected);
            prop_assert_eq!(updates, expected - 1);
            prop_assert!(configuration.axes.values().all(TuningParameter::is_max));
        }
    }
}
