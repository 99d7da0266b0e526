//! wgpu-backed compute device.
//!
//! Generated WGSL modules are compiled once per program name; each stage entry
//! point gets its own pipeline, built against an explicit bind-group layout
//! derived from the kernel's argument table.

use crate::device::{ComputeDevice, DeviceError, DeviceInfo, DeviceKind, Kernel, KernelArg};
use crate::planner::DispatchPlan;
use crate::simulated::compute_entry_points;
use anyhow::{anyhow, Result};
use kerneltune_ir::ResourceId;
use pollster::block_on;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

struct Program {
    module: wgpu::ShaderModule,
    entry_points: Vec<String>,
}

/// Pipelines are keyed by entry point and the read-only flag of each binding.
type PipelineKey = (String, String, Vec<(u32, bool)>);

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: DeviceInfo,
    programs: RefCell<HashMap<String, Program>>,
    pipelines: RefCell<HashMap<PipelineKey, Rc<(wgpu::BindGroupLayout, wgpu::ComputePipeline)>>>,
    buffers: RefCell<HashMap<ResourceId, wgpu::Buffer>>,
}

impl WgpuDevice {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| anyhow!("no suitable GPU adapter found"))?;

        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let supports_f64 = adapter.features().contains(wgpu::Features::SHADER_F64);
        let required_features = if supports_f64 {
            wgpu::Features::SHADER_F64
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("kerneltune device"),
                required_features,
                required_limits: limits.clone(),
            },
            None,
        ))?;

        let kind = match adapter_info.device_type {
            wgpu::DeviceType::DiscreteGpu
            | wgpu::DeviceType::IntegratedGpu
            | wgpu::DeviceType::VirtualGpu => DeviceKind::Gpu,
            wgpu::DeviceType::Cpu => DeviceKind::Cpu,
            wgpu::DeviceType::Other => DeviceKind::Accelerator,
        };

        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            vendor_id: adapter_info.vendor,
            kind,
            max_work_group_size: limits.max_compute_invocations_per_workgroup as usize,
            max_work_item_sizes: [
                limits.max_compute_workgroup_size_x as usize,
                limits.max_compute_workgroup_size_y as usize,
                limits.max_compute_workgroup_size_z as usize,
            ],
            local_mem_size: limits.max_compute_workgroup_storage_size as usize,
            supports_f64,
        };
        info!(
            name = %info.name,
            vendor_id = info.vendor_id,
            backend = ?adapter_info.backend,
            max_work_group_size = info.max_work_group_size,
            local_mem_size = info.local_mem_size,
            "wgpu device ready"
        );

        Ok(Self {
            device,
            queue,
            info,
            programs: RefCell::new(HashMap::new()),
            pipelines: RefCell::new(HashMap::new()),
            buffers: RefCell::new(HashMap::new()),
        })
    }

    fn pipeline_for(
        &self,
        kernel: &Kernel,
        key: PipelineKey,
    ) -> Result<Rc<(wgpu::BindGroupLayout, wgpu::ComputePipeline)>, DeviceError> {
        if let Some(cached) = self.pipelines.borrow().get(&key) {
            return Ok(Rc::clone(cached));
        }

        let programs = self.programs.borrow();
        let program = programs
            .get(kernel.program())
            .ok_or_else(|| DeviceError::ProgramNotFound(kernel.program().to_string()))?;

        let entries: Vec<wgpu::BindGroupLayoutEntry> = key
            .2
            .iter()
            .map(|&(binding, read_only)| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("kernel_layout"),
                    entries: &entries,
                });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("kernel_pipeline_layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.name()),
                layout: Some(&pipeline_layout),
                module: &program.module,
                entry_point: kernel.name(),
            });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::Dispatch {
                kernel: kernel.name().to_string(),
                message: err.to_string(),
            });
        }

        let built = Rc::new((bind_group_layout, pipeline));
        self.pipelines.borrow_mut().insert(key, Rc::clone(&built));
        Ok(built)
    }
}

impl ComputeDevice for WgpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_program(&self, name: &str, source: &str, force: bool) -> Result<(), DeviceError> {
        if !force && self.has_program(name) {
            return Ok(());
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::Compilation {
                program: name.to_string(),
                message: err.to_string(),
            });
        }

        let entry_points = compute_entry_points(source);
        debug!(program = name, entries = entry_points.len(), "shader module built");
        self.pipelines
            .borrow_mut()
            .retain(|(program, _, _), _| program != name);
        self.programs.borrow_mut().insert(
            name.to_string(),
            Program {
                module,
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
        let layout_key: Vec<(u32, bool)> = kernel
            .args()
            .iter()
            .map(|(&binding, arg)| (binding, !arg.is_buffer()))
            .collect();
        let key = (
            kernel.program().to_string(),
            kernel.name().to_string(),
            layout_key,
        );
        let built = self.pipeline_for(kernel, key)?;
        let (bind_group_layout, pipeline) = (&built.0, &built.1);

        // By-value arguments live in small read-only storage buffers.
        let mut value_buffers = Vec::new();
        for (&binding, arg) in kernel.args() {
            if let Some(bytes) = arg.value_bytes() {
                let buffer = self
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("kernel_value_arg"),
                        contents: &bytes,
                        usage: wgpu::BufferUsages::STORAGE,
                    });
                value_buffers.push((binding, buffer));
            }
        }

        let buffers = self.buffers.borrow();
        let mut entries = Vec::with_capacity(kernel.args().len());
        for (&binding, arg) in kernel.args() {
            let buffer = match arg {
                KernelArg::Buffer(id) => buffers.get(id).ok_or(DeviceError::UnknownResource(*id))?,
                _ => value_buffers
                    .iter()
                    .find(|(b, _)| *b == binding)
                    .map(|(_, buffer)| buffer)
                    .ok_or_else(|| DeviceError::Dispatch {
                        kernel: kernel.name().to_string(),
                        message: format!("binding {binding} has no value buffer"),
                    })?,
            };
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_bind_group"),
            layout: bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kernel_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(plan.workgroups[0], plan.workgroups[1], plan.workgroups[2]);
        }
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::Dispatch {
                kernel: kernel.name().to_string(),
                message: err.to_string(),
            });
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn write_buffer(&self, id: ResourceId, contents: &[u8]) -> Result<(), DeviceError> {
        let mut buffers = self.buffers.borrow_mut();
        if let Some(existing) = buffers.get(&id) {
            if existing.size() == contents.len() as u64 {
                self.queue.write_buffer(existing, 0, contents);
                return Ok(());
            }
        }

        // Storage bindings need at least one word.
        let mut padded = contents.to_vec();
        padded.resize(contents.len().max(4).next_multiple_of(4), 0);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("operand"),
                contents: &padded,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            });
        buffers.insert(id, buffer);
        Ok(())
    }

    fn read_buffer(&self, id: ResourceId) -> Result<Vec<u8>, DeviceError> {
        let buffers = self.buffers.borrow();
        let source = buffers.get(&id).ok_or(DeviceError::UnknownResource(id))?;
        let size = source.size();

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| DeviceError::Readback("failed to receive GPU map signal".into()))?
            .map_err(|err| DeviceError::Readback(err.to_string()))?;
        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }
}
