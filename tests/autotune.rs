use anyhow::Result;
use kerneltune::autotune::{AutotuneOptions, Autotuner, TuningCache, TuningConfiguration};
use kerneltune::device::{ComputeDevice, DeviceError, SimulatedDevice};
use kerneltune::ir::{BindingPolicy, Layout, Node, Operand, ScalarType, Statement};
use kerneltune::kernels::{
    Database, FamilyParameters, Generator, RowWiseReductionParameters, VectorAxpyParameters,
};

fn gemv(device: &SimulatedDevice) -> Result<Vec<Statement>> {
    let a = Operand::matrix(1, 256, 256, Layout::RowMajor, ScalarType::F32);
    let x = Operand::vector(2, 256, ScalarType::F32);
    let y = Operand::vector(3, 256, ScalarType::F32);
    for operand in [a, x, y] {
        device.write_buffer(operand.id, &vec![0u8; operand.element_count() * 4])?;
    }
    Ok(vec![Statement::assign(
        y,
        Node::mat_vec_prod(Node::leaf(a), Node::leaf(x)),
    )?])
}

#[test]
fn sweep_benchmarks_exactly_the_valid_combinations() -> Result<()> {
    let device = SimulatedDevice::wavefront64_gpu();
    let statements = gemv(&device)?;
    let mut configuration = TuningConfiguration::<RowWiseReductionParameters>::new(ScalarType::F32);
    configuration.add_tuning_param("num_groups_0", vec![16, 32])?;

    let mut expected_valid = 0;
    configuration.reset();
    loop {
        if !configuration.get_current()?.is_invalid(device.info()) {
            expected_valid += 1;
        }
        if !configuration.has_next() {
            break;
        }
        configuration.update();
    }

    let mut tuner = Autotuner::new(&device, AutotuneOptions::default());
    let results = tuner.benchmark(&statements, &mut configuration)?;
    assert_eq!(results.len(), expected_valid);
    assert!(expected_valid < configuration.combinations());
    for (_, params) in results.iter() {
        assert!(!params.is_invalid(device.info()));
    }
    let times: Vec<f64> = results.iter().map(|(time, _)| *time).collect();
    assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
    Ok(())
}

#[test]
fn tuned_parameters_flow_back_into_execution() -> Result<()> {
    let device = SimulatedDevice::gpu();
    let statements = gemv(&device)?;
    let candidates = [
        RowWiseReductionParameters::new(ScalarType::F32, 1, 2, 16, 8),
        RowWiseReductionParameters::new(ScalarType::F32, 4, 1, 64, 4),
    ];
    let mut tuner = Autotuner::new(&device, AutotuneOptions::default());
    let results = tuner.benchmark_list(&statements, &candidates)?;
    let (time, best) = results.best().copied().expect("two results");

    let mut cache = TuningCache::new();
    cache.record(device.info(), time, &best)?;
    let mut database = Database::<RowWiseReductionParameters>::builtin();
    cache.apply_to(&mut database)?;

    device.clear_dispatches();
    let generator = Generator::new(&device, BindingPolicy::AliasByIdentity);
    let used = generator.execute(&database, &statements)?;
    assert_eq!(used, best);
    let dispatch = &device.dispatches()[0];
    assert_eq!(
        dispatch.local_size,
        [best.base().local_size_0() as u32, best.base().local_size_1() as u32]
    );
    Ok(())
}

#[test]
fn a_failed_compilation_stops_the_sweep() -> Result<()> {
    let device = SimulatedDevice::gpu().with_compile_hook(|_, source| {
        source
            .contains("local_size=(256, 1)")
            .then(|| "workgroup too large for this driver".to_string())
    });
    let x = Operand::vector(1, 4096, ScalarType::F32);
    let y = Operand::vector(2, 4096, ScalarType::F32);
    for operand in [x, y] {
        device.write_buffer(operand.id, &vec![0u8; 4096 * 4])?;
    }
    let statements = vec![Statement::inplace_add(y, Node::leaf(x))?];

    let mut configuration = TuningConfiguration::<VectorAxpyParameters>::new(ScalarType::F32);
    configuration.add_tuning_param("simd_width", vec![1])?;
    configuration.add_tuning_param("num_groups", vec![8])?;
    configuration.add_tuning_param("local_size_0", vec![128, 256, 512])?;

    let mut tuner = Autotuner::new(&device, AutotuneOptions::default());
    let error = tuner
        .benchmark(&statements, &mut configuration)
        .expect_err("256 fails to compile");
    match error.downcast_ref::<DeviceError>() {
        Some(DeviceError::Compilation { message, .. }) => {
            assert!(message.contains("too large"))
        }
        other => panic!("unexpected error {other:?}"),
    }
    // 128 ran, 512 was never reached.
    assert_eq!(device.dispatches().len(), 1);
    Ok(())
}
