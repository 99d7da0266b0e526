//! Core autotuning logic.

use crate::trace::TraceLog;
use crate::tuning::{Tunable, TuningConfiguration};
use anyhow::{ensure, Context, Result};
use kerneltune_device::ComputeDevice;
use kerneltune_ir::{BindingPolicy, Statement};
use kerneltune_kernels::{FamilyParameters, Generator, KernelFamily};
use std::io::Write;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct AutotuneOptions {
    /// Enqueues timed per configuration.
    pub repeats: usize,
    pub policy: BindingPolicy,
}

impl Default for AutotuneOptions {
    fn default() -> Self {
        Self {
            repeats: 1,
            policy: BindingPolicy::AliasByIdentity,
        }
    }
}

/// Benchmarked configurations, fastest first.
///
/// Entries with equal times keep their insertion order.
#[derive(Debug, Clone)]
pub struct BenchmarkResults<P> {
    entries: Vec<(f64, P)>,
}

impl<P> Default for BenchmarkResults<P> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<P> BenchmarkResults<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, time: f64, params: P) {
        let at = self.entries.partition_point(|(existing, _)| *existing <= time);
        self.entries.insert(at, (time, params));
    }

    pub fn best(&self) -> Option<&(f64, P)> {
        self.entries.first()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(f64, P)> {
        self.entries.iter()
    }

    pub fn into_vec(self) -> Vec<(f64, P)> {
        self.entries
    }
}

pub struct Autotuner<'d> {
    generator: Generator<'d>,
    options: AutotuneOptions,
    trace: Option<TraceLog<Box<dyn Write>>>,
}

impl<'d> Autotuner<'d> {
    pub fn new(device: &'d dyn ComputeDevice, options: AutotuneOptions) -> Self {
        Self {
            generator: Generator::new(device, options.policy),
            options,
            trace: None,
        }
    }

    pub fn with_trace(mut self, writer: Box<dyn Write>) -> Self {
        self.trace = Some(TraceLog::new(writer));
        self
    }

    pub fn options(&self) -> &AutotuneOptions {
        &self.options
    }

    /// Sweeps every device-valid combination of `configuration`.
    ///
    /// A compilation failure aborts the sweep.
    pub fn benchmark<P: Tunable>(
        &mut self,
        statements: &[Statement],
        configuration: &mut TuningConfiguration<P>,
    ) -> Result<BenchmarkResults<P>> {
        let device = self.generator.device().info();
        // Surfaces missing axes instead of skipping every combination.
        configuration
            .get_current()
            .context("tuning configuration does not describe a parameter set")?;

        let mut valid = 0usize;
        configuration.reset();
        loop {
            if !configuration.is_invalid(device) {
                valid += 1;
            }
            if !configuration.has_next() {
                break;
            }
            configuration.update();
        }
        configuration.reset();
        info!(
            family = %P::FAMILY,
            device = %device.name,
            combinations = configuration.combinations(),
            valid,
            "starting sweep"
        );
        self.write_header(&P::fallback(configuration.scalar_type()))?;

        let mut results = BenchmarkResults::new();
        let mut done = 0usize;
        loop {
            if !configuration.is_invalid(device) {
                let params = configuration.get_current()?;
                let time = self.benchmark_impl(statements, &params)?;
                done += 1;
                self.record(&mut results, time, params, done, valid)?;
            }
            if !configuration.has_next() {
                break;
            }
            configuration.update();
        }
        Ok(results)
    }

    /// Benchmarks each of `candidates` as given, without validity filtering.
    pub fn benchmark_list<P: KernelFamily>(
        &mut self,
        statements: &[Statement],
        candidates: &[P],
    ) -> Result<BenchmarkResults<P>> {
        let mut results = BenchmarkResults::new();
        if let Some(first) = candidates.first() {
            self.write_header(first)?;
        }
        for (index, params) in candidates.iter().enumerate() {
            let time = self.benchmark_impl(statements, params)?;
            self.record(&mut results, time, params.clone(), index + 1, candidates.len())?;
        }
        Ok(results)
    }

    /// Average seconds per enqueue of `statements` under exactly `params`.
    pub fn benchmark_impl<P: KernelFamily>(
        &self,
        statements: &[Statement],
        params: &P,
    ) -> Result<f64> {
        ensure!(self.options.repeats > 0, "at least one repeat is required");
        let program = self.generator.compile(params, statements, true)?;

        let start = Instant::now();
        for _ in 0..self.options.repeats {
            self.generator.enqueue(params, &program, statements)?;
        }
        self.generator.device().finish()?;
        let time = start.elapsed().as_secs_f64() / self.options.repeats as f64;
        debug!(program = %program, time, "benchmarked");
        Ok(time)
    }

    fn write_header<P: FamilyParameters>(&mut self, sample: &P) -> Result<()> {
        match self.trace.as_mut() {
            Some(trace) => trace.header(&sample.csv_header()),
            None => Ok(()),
        }
    }

    fn record<P: FamilyParameters>(
        &mut self,
        results: &mut BenchmarkResults<P>,
        time: f64,
        params: P,
        done: usize,
        total: usize,
    ) -> Result<()> {
        if let Some(trace) = self.trace.as_mut() {
            trace.record(time, &params.csv_row())?;
        }
        results.insert(time, params);
        if let Some((best_time, best)) = results.best() {
            let percent = done as f64 * 100.0 / total.max(1) as f64;
            info!(
                progress = %format!("{percent:.2}%"),
                best_time = %format!("{best_time:.3e}"),
                best = %best.csv_row(),
                "autotuning"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kerneltune_device::{DeviceError, SimulatedDevice};
    use kerneltune_ir::{Node, Operand, ResourceId, ScalarType};
    use kerneltune_kernels::{ReductionParameters, VectorAxpyParameters};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn prepared_device(device: SimulatedDevice) -> SimulatedDevice {
        for id in [1, 2, 10] {
            device.write_buffer(ResourceId(id), &[0u8; 4096]).unwrap();
        }
        device
    }

    fn axpy() -> Vec<Statement> {
        let x = Operand::vector(1, 1024, ScalarType::F32);
        let y = Operand::vector(2, 1024, ScalarType::F32);
        vec![Statement::inplace_add(y, Node::leaf(x)).unwrap()]
    }

    fn dot() -> Vec<Statement> {
        let x = Operand::vector(1, 1024, ScalarType::F32);
        let y = Operand::vector(2, 1024, ScalarType::F32);
        let s = Operand::device_scalar(10, ScalarType::F32);
        vec![Statement::assign(s, Node::inner_prod(Node::leaf(x), Node::leaf(y))).unwrap()]
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn results_rank_ascending_with_stable_ties() {
        let mut results = BenchmarkResults::new();
        results.insert(3.0, "c");
        results.insert(1.0, "a");
        results.insert(2.0, "b1");
        results.insert(2.0, "b2");
        let order: Vec<_> = results.iter().map(|(_, p)| *p).collect();
        assert_eq!(order, vec!["a", "b1", "b2", "c"]);
        assert_eq!(results.best(), Some(&(1.0, "a")));
    }

    #[test]
    fn sweep_skips_invalid_combinations() {
        let device = prepared_device(SimulatedDevice::wavefront64_gpu());
        let mut tuner = Autotuner::new(&device, AutotuneOptions::default());
        let mut configuration = TuningConfiguration::<VectorAxpyParameters>::new(ScalarType::F32);
        configuration.add_tuning_param("simd_width", vec![1, 3]).unwrap();
        configuration.add_tuning_param("local_size_0", vec![32, 64, 128, 512]).unwrap();
        configuration.add_tuning_param("num_groups", vec![4]).unwrap();

        let results = tuner.benchmark(&axpy(), &mut configuration).unwrap();
        // Width 3, the 32 misaligned to the wavefront and 512 above the device limit are skipped.
        assert_eq!(results.len(), 2);
        for (_, params) in results.iter() {
            assert!(!params.is_invalid(device.info()));
        }
        assert_eq!(device.dispatches().len(), 2);
        assert_eq!(device.finish_count(), 2);
    }

    #[test]
    fn every_valid_combination_is_compiled_under_forced_names() {
        let device = prepared_device(SimulatedDevice::gpu());
        let mut tuner = Autotuner::new(&device, AutotuneOptions::default());
        let mut configuration = TuningConfiguration::<ReductionParameters>::new(ScalarType::F32);
        configuration.add_tuning_param("simd_width", vec![1, 2]).unwrap();
        configuration.add_tuning_param("local_size_0", vec![64, 96]).unwrap();
        configuration.add_tuning_param("num_groups", vec![8, 16]).unwrap();

        let results = tuner.benchmark(&dot(), &mut configuration).unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(device.build_count(), 4);
        // Two stages per benchmark.
        assert_eq!(device.dispatches().len(), 8);
        assert!(device
            .dispatches()
            .iter()
            .all(|dispatch| dispatch.program.ends_with("_forced")));
    }

    #[test]
    fn compilation_failure_aborts_the_sweep() {
        let device = prepared_device(
            SimulatedDevice::gpu()
                .with_compile_hook(|_, source| source.contains("simd_width=4").then(|| "rejected".into())),
        );
        let mut tuner = Autotuner::new(&device, AutotuneOptions::default());
        let mut configuration = TuningConfiguration::<VectorAxpyParameters>::new(ScalarType::F32);
        configuration.add_tuning_param("simd_width", vec![1, 4, 8]).unwrap();
        configuration.add_tuning_param("local_size_0", vec![64]).unwrap();
        configuration.add_tuning_param("num_groups", vec![8]).unwrap();

        let err = tuner.benchmark(&axpy(), &mut configuration).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeviceError>(),
            Some(DeviceError::Compilation { .. })
        ));
        // Width 8 is never reached.
        assert_eq!(device.build_count(), 1);
    }

    #[test]
    fn explicit_lists_are_benchmarked_as_given() {
        let device = prepared_device(SimulatedDevice::gpu());
        let options = AutotuneOptions {
            repeats: 3,
            ..AutotuneOptions::default()
        };
        let mut tuner = Autotuner::new(&device, options);
        let candidates = [
            VectorAxpyParameters::new(ScalarType::F32, 1, 64, 8),
            VectorAxpyParameters::new(ScalarType::F32, 2, 128, 8),
        ];
        let results = tuner.benchmark_list(&axpy(), &candidates).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(device.dispatches().len(), 6);
        assert!(results.iter().all(|(time, _)| *time >= 0.0));
    }

    #[test]
    fn trace_rows_follow_the_header() {
        let device = prepared_device(SimulatedDevice::gpu());
        let buffer = SharedBuffer::default();
        let mut tuner = Autotuner::new(&device, AutotuneOptions::default())
            .with_trace(Box::new(buffer.clone()));
        let mut configuration = TuningConfiguration::<VectorAxpyParameters>::new(ScalarType::F32);
        configuration.add_tuning_param("simd_width", vec![1, 2]).unwrap();
        configuration.add_tuning_param("local_size_0", vec![64]).unwrap();
        configuration.add_tuning_param("num_groups", vec![8]).unwrap();
        tuner.benchmark(&axpy(), &mut configuration).unwrap();

        let text = String::from_utf8(buffer.0.borrow().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "time,scalar_bytes,simd_width,local_size_0,local_size_1,num_kernels,num_groups"
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with(",4,1,64,1,1,8"));
        assert!(lines[2].ends_with(",4,2,64,1,1,8"));
    }
}
