//! Device selection, sample workloads and the generate/tune drivers.

use anyhow::{bail, ensure, Context, Result};
use kerneltune_autotune::{AutotuneOptions, Autotuner, Tunable, TuningCache, TuningConfiguration};
use kerneltune_device::{
    ComputeDevice, DeviceInfo, SimulatedDevice, WgpuDevice, WAVEFRONT64_VENDOR_ID,
};
use kerneltune_ir::{BindingPolicy, Layout, Node, Operand, OperandKind, ScalarType, Statement};
use kerneltune_kernels::{Database, Family, FamilyParameters, Generator, KernelTemplate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Record dispatches instead of running on a real adapter.
    pub simulate: bool,
    /// Vendor id reported by the simulated device.
    pub vendor: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TuneOptions {
    pub scalar_type: ScalarType,
    pub space: Option<PathBuf>,
    pub repeats: usize,
    pub trace: Option<PathBuf>,
    pub cache: Option<PathBuf>,
    pub top: usize,
}

#[derive(Debug, Serialize)]
pub struct RankedEntry {
    pub time: f64,
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct TuneReport {
    pub family: Family,
    pub device: String,
    pub evaluated: usize,
    pub ranking: Vec<RankedEntry>,
}

pub struct TuneSession {
    device: Box<dyn ComputeDevice>,
}

impl TuneSession {
    pub fn new(options: SessionOptions) -> Result<Self> {
        let device: Box<dyn ComputeDevice> = if options.simulate {
            Box::new(simulated_device(options.vendor))
        } else {
            if options.vendor.is_some() {
                bail!("--vendor only applies to simulated devices");
            }
            Box::new(WgpuDevice::new()?)
        };
        info!(device = %device.info().name, "session ready");
        Ok(Self { device })
    }

    pub fn info(&self) -> &DeviceInfo {
        self.device.info()
    }

    /// A representative statement for `family` over operands of about `size`
    /// elements each.
    ///
    /// Matrix families use the largest square matrix within `size` elements
    /// and vectors of its side. Operand buffers are uploaded filled with ones.
    pub fn workload(
        &self,
        family: Family,
        size: usize,
        scalar_type: ScalarType,
    ) -> Result<Vec<Statement>> {
        ensure!(
            size > 0 && u32::try_from(size).is_ok(),
            "workload size {size} must be between 1 and {}",
            u32::MAX
        );
        let extent = match family {
            Family::VectorAxpy | Family::Reduction => size,
            Family::MatrixAxpy | Family::RowWiseReduction => square_side(size),
        };
        let vector = |id| Operand::vector(id, extent, scalar_type);
        let matrix = |id, layout| Operand::matrix(id, extent, extent, layout, scalar_type);
        let alpha = Operand::host_scalar(100, 0.5, scalar_type);
        let statement = match family {
            Family::VectorAxpy => {
                Statement::inplace_add(vector(2), Node::leaf(vector(1)).scale(alpha))?
            }
            Family::MatrixAxpy => Statement::assign(
                matrix(1, Layout::RowMajor),
                Node::leaf(matrix(2, Layout::RowMajor))
                    + Node::leaf(matrix(3, Layout::ColumnMajor)).trans().scale(alpha),
            )?,
            Family::Reduction => Statement::assign(
                Operand::device_scalar(3, scalar_type),
                Node::inner_prod(Node::leaf(vector(1)), Node::leaf(vector(2))),
            )?,
            Family::RowWiseReduction => Statement::assign(
                vector(3),
                Node::mat_vec_prod(
                    Node::leaf(matrix(1, Layout::RowMajor)),
                    Node::leaf(vector(2)),
                ),
            )?,
        };
        for operand in statement.operands() {
            if !matches!(operand.kind, OperandKind::HostScalar(_)) {
                self.upload_ones(operand)?;
            }
        }
        Ok(vec![statement])
    }

    fn upload_ones(&self, operand: &Operand) -> Result<()> {
        let count = operand.element_count();
        match operand.scalar_type {
            ScalarType::F32 => self
                .device
                .write_buffer(operand.id, bytemuck::cast_slice(&vec![1.0f32; count]))?,
            ScalarType::F64 => self
                .device
                .write_buffer(operand.id, bytemuck::cast_slice(&vec![1.0f64; count]))?,
        }
        Ok(())
    }

    fn database<P: Tunable>(&self, cache: Option<&Path>) -> Result<Database<P>> {
        let mut database = Database::<P>::builtin();
        if let Some(path) = cache {
            let applied = TuningCache::load_from_file(path)?.apply_to(&mut database)?;
            info!(path = %path.display(), applied, "loaded tuned parameters");
        }
        Ok(database)
    }

    /// Source generated with the parameters the database picks for this device.
    pub fn generate<P: Tunable>(
        &self,
        statements: &[Statement],
        cache: Option<&Path>,
    ) -> Result<String> {
        let first = statements.first().context("no statements to generate")?;
        let database = self.database::<P>(cache)?;
        let params = database.get(self.info(), first.scalar_type());
        info!(family = %P::FAMILY, params = %params.csv_row(), "generating");
        let generator = Generator::new(self.device.as_ref(), BindingPolicy::AliasByIdentity);
        let source = KernelTemplate::new(&params, generator.policy()).generate(statements)?;
        generator.execute(&database, statements)?;
        self.device.finish()?;
        Ok(source)
    }

    pub fn tune<P: Tunable>(
        &self,
        statements: &[Statement],
        options: &TuneOptions,
    ) -> Result<TuneReport> {
        let mut configuration = TuningConfiguration::<P>::new(options.scalar_type);
        if let Some(path) = &options.space {
            for (name, values) in load_space(path)? {
                configuration.add_tuning_param(name, values)?;
            }
        }

        let tune_options = AutotuneOptions {
            repeats: options.repeats,
            ..AutotuneOptions::default()
        };
        let mut tuner = Autotuner::new(self.device.as_ref(), tune_options);
        if let Some(path) = &options.trace {
            let file = File::create(path)
                .with_context(|| format!("failed to create trace {}", path.display()))?;
            tuner = tuner.with_trace(Box::new(BufWriter::new(file)));
        }
        let results = tuner.benchmark(statements, &mut configuration)?;

        if let (Some(path), Some((time, best))) = (&options.cache, results.best()) {
            let mut cache = TuningCache::load_from_file(path)?;
            if cache.record(self.info(), *time, best)? {
                cache.save_to_file(path)?;
                info!(path = %path.display(), "tuning cache updated");
            }
        }

        let evaluated = results.len();
        let ranking = results
            .iter()
            .take(options.top)
            .map(|(time, params)| {
                Ok(RankedEntry {
                    time: *time,
                    params: serde_json::to_value(params)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TuneReport {
            family: P::FAMILY,
            device: self.info().name.clone(),
            evaluated,
            ranking,
        })
    }
}

/// Largest `side` with `side * side <= elements`.
fn square_side(elements: usize) -> usize {
    let mut side = (elements as f64).sqrt() as usize;
    while side * side > elements {
        side -= 1;
    }
    while (side + 1) * (side + 1) <= elements {
        side += 1;
    }
    side
}

fn simulated_device(vendor: Option<u32>) -> SimulatedDevice {
    match vendor {
        Some(WAVEFRONT64_VENDOR_ID) => SimulatedDevice::wavefront64_gpu(),
        Some(vendor_id) => {
            let mut info = SimulatedDevice::gpu().info().clone();
            info.vendor_id = vendor_id;
            SimulatedDevice::new(info)
        }
        None => SimulatedDevice::gpu(),
    }
}

/// Axis overrides: a JSON object of axis name to candidate list.
fn load_space(path: &Path) -> Result<BTreeMap<String, Vec<usize>>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read search space {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("search space {} is not an axis map", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kerneltune_kernels::{ReductionParameters, VectorAxpyParameters};

    fn simulated() -> TuneSession {
        TuneSession::new(SessionOptions {
            simulate: true,
            vendor: None,
        })
        .unwrap()
    }

    #[test]
    fn vendor_override_selects_the_wavefront_preset() {
        assert_eq!(
            simulated_device(Some(WAVEFRONT64_VENDOR_ID))
                .info()
                .scheduling_granularity(),
            64
        );
        assert_eq!(simulated_device(Some(0x8086)).info().vendor_id, 0x8086);
    }

    #[test]
    fn matrix_workloads_stay_within_the_element_budget() {
        let session = simulated();
        for family in [Family::MatrixAxpy, Family::RowWiseReduction] {
            let statements = session
                .workload(family, 1 << 16, ScalarType::F32)
                .unwrap();
            for operand in statements[0].operands() {
                assert!(operand.element_count() <= 1 << 16);
            }
            let target = if family == Family::MatrixAxpy { 256 * 256 } else { 256 };
            assert_eq!(statements[0].target().element_count(), target);
        }
        assert_eq!(square_side(1000), 31);
        assert_eq!(square_side(1), 1);
        assert!(session
            .workload(Family::VectorAxpy, 0, ScalarType::F32)
            .is_err());
        assert!(session
            .workload(Family::Reduction, 1 << 33, ScalarType::F32)
            .is_err());
    }

    #[test]
    fn generate_prints_one_entry_point_per_stage() {
        let session = simulated();
        let statements = session
            .workload(Family::Reduction, 4096, ScalarType::F32)
            .unwrap();
        let source = session
            .generate::<ReductionParameters>(&statements, None)
            .unwrap();
        assert_eq!(kerneltune_device::compute_entry_points(&source).len(), 2);
    }

    #[test]
    fn tune_reports_the_fastest_first() {
        let session = simulated();
        let dir = std::env::temp_dir().join(format!("kerneltune-session-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let space = dir.join("space.json");
        std::fs::write(
            &space,
            r#"{"simd_width": [1, 2], "local_size_0": [64, 128], "num_groups": [8]}"#,
        )
        .unwrap();
        let cache = dir.join("cache.json");

        let statements = session
            .workload(Family::VectorAxpy, 1 << 12, ScalarType::F32)
            .unwrap();
        let options = TuneOptions {
            scalar_type: ScalarType::F32,
            space: Some(space),
            repeats: 1,
            trace: Some(dir.join("trace.csv")),
            cache: Some(cache.clone()),
            top: 3,
        };
        let report = session
            .tune::<VectorAxpyParameters>(&statements, &options)
            .unwrap();
        assert_eq!(report.evaluated, 4);
        assert_eq!(report.ranking.len(), 3);
        assert!(report.ranking[0].time <= report.ranking[1].time);

        let trace = std::fs::read_to_string(dir.join("trace.csv")).unwrap();
        assert_eq!(trace.lines().count(), 5);
        assert_eq!(TuningCache::load_from_file(&cache).unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
