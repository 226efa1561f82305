//! Device-resident backend driven through wgpu.
//!
//! The estimate, support, modulus and all work buffers are allocated once when
//! the session starts. Volumes only cross the host/device boundary at upload
//! and in [`Backend::snapshot`]; per-step errors and support sizes are read
//! back as a handful of scalars.
//!
//! Arithmetic runs in `f32`. The transform is a direct per-axis DFT, so any
//! axis length works without padding.
//!
//! Against the `f64` host backend, per-step errors agree to about `1e-4` over
//! short runs. HIO feeds rounding back into the estimate, so after a few hundred
//! steps individual voxels drift by up to about `1e-2` of the peak magnitude;
//! [`F32_DRIFT_TOLERANCE`] bounds that drift.

use std::sync::mpsc;

use bytemuck::{bytes_of, cast_slice, Pod, Zeroable};
use ndarray::Array3;
use num_complex::Complex64;
use pollster::block_on;
use wgpu::util::DeviceExt;

use crate::backend::{Backend, ExecutionTarget};
use crate::data::{MeasuredModulus, Shape, SupportMask};
use crate::engine::UpdateRule;
use crate::error::{PhaseError, Result};
use crate::options::SolverOptions;
use crate::shrinkwrap::{kernel_radius, validate_parameters};

const SHADER: &str = include_str!("phase_retrieval.wgsl");

/// Largest per-voxel difference from the host backend, relative to the peak
/// magnitude, expected after a full ER/shrinkwrap/HIO recipe.
pub const F32_DRIFT_TOLERANCE: f64 = 5e-2;

const WORKGROUP: u32 = 64;
const MAX_GROUPS_PER_DIMENSION: u32 = 65_535;

/// `stats[0]` holds the smoothed maximum and `stats[1]` the support size;
/// per-step errors follow.
const FIRST_ERROR_SLOT: usize = 2;
const ERROR_SLOTS: usize = 1024;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct Params {
    nx: u32,
    ny: u32,
    nz: u32,
    total: u32,
    axis: u32,
    inverse: u32,
    src_b: u32,
    rule: u32,
    beta: f32,
    epsilon: f32,
    threshold: f32,
    sigma: f32,
    radius: u32,
    slot: u32,
    _pad0: u32,
    _pad1: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kernel {
    CopyEstimate,
    DftAxis,
    ImposeModulus,
    ApplyRule,
    Magnitude,
    CopyReal,
    BlurAxis,
    ThresholdSupport,
    ReduceError,
    ReduceMax,
    ReduceCount,
}

impl Kernel {
    const ALL: [Kernel; 11] = [
        Kernel::CopyEstimate,
        Kernel::DftAxis,
        Kernel::ImposeModulus,
        Kernel::ApplyRule,
        Kernel::Magnitude,
        Kernel::CopyReal,
        Kernel::BlurAxis,
        Kernel::ThresholdSupport,
        Kernel::ReduceError,
        Kernel::ReduceMax,
        Kernel::ReduceCount,
    ];

    fn entry_point(self) -> &'static str {
        match self {
            Kernel::CopyEstimate => "copy_estimate",
            Kernel::DftAxis => "dft_axis",
            Kernel::ImposeModulus => "impose_modulus",
            Kernel::ApplyRule => "apply_rule",
            Kernel::Magnitude => "magnitude",
            Kernel::CopyReal => "copy_real",
            Kernel::BlurAxis => "blur_axis",
            Kernel::ThresholdSupport => "threshold_support",
            Kernel::ReduceError => "reduce_error",
            Kernel::ReduceMax => "reduce_max",
            Kernel::ReduceCount => "reduce_count",
        }
    }

    /// Reductions run as a single workgroup.
    fn is_reduction(self) -> bool {
        matches!(
            self,
            Kernel::ReduceError | Kernel::ReduceMax | Kernel::ReduceCount
        )
    }
}

fn rule_code(rule: &UpdateRule) -> Option<(u32, f32)> {
    match rule {
        UpdateRule::ErrorReduction => Some((0, 0.0)),
        UpdateRule::HybridInputOutput { beta } => Some((1, *beta as f32)),
        UpdateRule::SolventFlipping => None,
    }
}

fn unavailable(reason: impl Into<String>) -> PhaseError {
    PhaseError::UnsupportedTarget {
        target: ExecutionTarget::Gpu,
        reason: reason.into(),
    }
}

/// wgpu backend; see the module documentation for the residency model.
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Vec<wgpu::ComputePipeline>,
    bind_group: wgpu::BindGroup,
    params_buffer: wgpu::Buffer,
    estimate: wgpu::Buffer,
    support: wgpu::Buffer,
    modulus: wgpu::Buffer,
    stats: wgpu::Buffer,
    _scratch: [wgpu::Buffer; 4],
    shape: Shape,
    base: Params,
}

impl std::fmt::Debug for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBackend")
            .field("shape", &self.shape)
            .field("estimate_bytes", &self.estimate.size())
            .field("modulus_bytes", &self.modulus.size())
            .finish()
    }
}

impl GpuBackend {
    /// Acquires a device and uploads the session's volumes.
    pub fn new(
        modulus: &MeasuredModulus,
        support: &SupportMask,
        estimate: &Array3<Complex64>,
        options: &SolverOptions,
    ) -> Result<Self> {
        let shape = modulus.shape();
        let total = modulus.len();
        let total_u32 = u32::try_from(total)
            .map_err(|_| unavailable(format!("volume of {total} voxels exceeds u32 indexing")))?;

        let instance = wgpu::Instance::default();
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| unavailable("no compatible wgpu adapter was found"))?;
        let info = adapter.get_info();

        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("phaseret.gpu.device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|err| unavailable(format!("failed to acquire device: {err}")))?;

        let complex_bytes = (total * std::mem::size_of::<[f32; 2]>()) as u64;
        let real_bytes = (total * std::mem::size_of::<f32>()) as u64;
        let limit = device.limits().max_storage_buffer_binding_size as u64;
        if complex_bytes > limit {
            return Err(unavailable(format!(
                "volume needs {complex_bytes} bytes per buffer, device allows {limit}"
            )));
        }

        let host_estimate: Vec<[f32; 2]> = estimate
            .iter()
            .map(|c| [c.re as f32, c.im as f32])
            .collect();
        let host_modulus: Vec<f32> = modulus.values().iter().map(|&m| m as f32).collect();
        let host_support: Vec<f32> = support.values().iter().map(|&w| w as f32).collect();

        let storage = wgpu::BufferUsages::STORAGE;
        let estimate_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("phaseret.gpu.estimate"),
            contents: cast_slice(&host_estimate),
            usage: storage | wgpu::BufferUsages::COPY_SRC,
        });
        let modulus_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("phaseret.gpu.modulus"),
            contents: cast_slice(&host_modulus),
            usage: storage,
        });
        let support_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("phaseret.gpu.support"),
            contents: cast_slice(&host_support),
            usage: storage | wgpu::BufferUsages::COPY_SRC,
        });
        let scratch = |label: &'static str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: storage,
                mapped_at_creation: false,
            })
        };
        let work_a = scratch("phaseret.gpu.work_a", complex_bytes);
        let work_b = scratch("phaseret.gpu.work_b", complex_bytes);
        let real_a = scratch("phaseret.gpu.real_a", real_bytes);
        let real_b = scratch("phaseret.gpu.real_b", real_bytes);
        let stats = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("phaseret.gpu.stats"),
            size: ((FIRST_ERROR_SLOT + ERROR_SLOTS) * std::mem::size_of::<f32>()) as u64,
            usage: storage | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("phaseret.gpu.params"),
            size: std::mem::size_of::<Params>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("phaseret.gpu.layout"),
            entries: &[
                storage_entry(0, false),
                storage_entry(1, false),
                storage_entry(2, false),
                storage_entry(3, true),
                storage_entry(4, false),
                storage_entry(5, false),
                storage_entry(6, false),
                storage_entry(7, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 8,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("phaseret.gpu.pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("phaseret.gpu.shader"),
            source: wgpu::ShaderSource::Wgsl(SHADER.into()),
        });
        let pipelines: Vec<wgpu::ComputePipeline> = Kernel::ALL
            .iter()
            .map(|kernel| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kernel.entry_point()),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: kernel.entry_point(),
                    compilation_options: Default::default(),
                })
            })
            .collect();
        if let Some(err) = block_on(device.pop_error_scope()) {
            return Err(unavailable(format!("failed to build kernels: {err}")));
        }

        let buffers = [
            &estimate_buffer,
            &work_a,
            &work_b,
            &modulus_buffer,
            &support_buffer,
            &real_a,
            &real_b,
            &stats,
            &params_buffer,
        ];
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("phaseret.gpu.bind_group"),
            layout: &layout,
            entries: &entries,
        });

        log::info!(
            "gpu session on `{}` ({:?}), shape {:?}",
            info.name,
            info.backend,
            shape
        );

        let base = Params {
            nx: shape[0] as u32,
            ny: shape[1] as u32,
            nz: shape[2] as u32,
            total: total_u32,
            epsilon: options.support_epsilon as f32,
            ..Params::default()
        };

        Ok(Self {
            device,
            queue,
            pipelines,
            bind_group,
            params_buffer,
            estimate: estimate_buffer,
            support: support_buffer,
            modulus: modulus_buffer,
            stats,
            _scratch: [work_a, work_b, real_a, real_b],
            shape,
            base,
        })
    }

    /// Workgroup grid covering every voxel, folded into two dimensions.
    fn grid(&self) -> (u32, u32) {
        let groups = self.base.total.div_ceil(WORKGROUP).max(1);
        let x = groups.min(MAX_GROUPS_PER_DIMENSION);
        (x, groups.div_ceil(x))
    }

    fn dispatch(&self, kernel: Kernel, params: Params) {
        self.queue
            .write_buffer(&self.params_buffer, 0, bytes_of(&params));
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("phaseret.gpu.encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry_point()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipelines[kernel as usize]);
            pass.set_bind_group(0, &self.bind_group, &[]);
            let (x, y) = if kernel.is_reduction() {
                (1, 1)
            } else {
                self.grid()
            };
            pass.dispatch_workgroups(x, y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    /// Three DFT passes. Forward reads `work_a` and ends in `work_b`; inverse the reverse.
    fn transform(&self, inverse: bool) {
        for axis in 0..3u32 {
            let src_b = (axis % 2 == 1) != inverse;
            self.dispatch(
                Kernel::DftAxis,
                Params {
                    axis,
                    inverse: inverse as u32,
                    src_b: src_b as u32,
                    ..self.base
                },
            );
        }
    }

    fn encode_step(&self, code: u32, beta: f32, slot: usize) {
        self.dispatch(Kernel::CopyEstimate, self.base);
        self.transform(false);
        self.dispatch(Kernel::ImposeModulus, self.base);
        self.dispatch(
            Kernel::ReduceError,
            Params {
                slot: slot as u32,
                ..self.base
            },
        );
        self.transform(true);
        self.dispatch(
            Kernel::ApplyRule,
            Params {
                rule: code,
                beta,
                ..self.base
            },
        );
    }

    /// Copies `len` floats starting at float `offset` of `buffer` back to the host.
    fn read_back(&self, buffer: &wgpu::Buffer, offset: usize, len: usize) -> Result<Vec<f32>> {
        let bytes = (len * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("phaseret.gpu.staging"),
            size: bytes,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("phaseret.gpu.readback"),
            });
        encoder.copy_buffer_to_buffer(
            buffer,
            (offset * std::mem::size_of::<f32>()) as u64,
            &staging,
            0,
            bytes,
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| PhaseError::device("readback channel closed"))?
            .map_err(|err| PhaseError::device(format!("failed to map readback buffer: {err}")))?;
        let data = slice.get_mapped_range();
        let values = cast_slice::<u8, f32>(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(values)
    }
}

impl Backend for GpuBackend {
    fn target(&self) -> ExecutionTarget {
        ExecutionTarget::Gpu
    }

    fn supports(&self, rule: &UpdateRule) -> bool {
        rule_code(rule).is_some()
    }

    fn step(&mut self, rule: UpdateRule) -> Result<f64> {
        let mut errors = Vec::with_capacity(1);
        self.run(rule, 1, &mut errors)?;
        errors
            .first()
            .copied()
            .ok_or_else(|| PhaseError::device("no error was read back"))
    }

    /// Errors are appended one readback chunk at a time, so a failed readback
    /// keeps the errors of every chunk read before it.
    fn run(&mut self, rule: UpdateRule, iterations: usize, errors: &mut Vec<f64>) -> Result<()> {
        let (code, beta) = rule_code(&rule).ok_or(PhaseError::UnsupportedOperation {
            operation: rule.name(),
            target: ExecutionTarget::Gpu,
        })?;
        let mut remaining = iterations;
        while remaining > 0 {
            let chunk = remaining.min(ERROR_SLOTS);
            for offset in 0..chunk {
                self.encode_step(code, beta, FIRST_ERROR_SLOT + offset);
            }
            let values = self.read_back(&self.stats, FIRST_ERROR_SLOT, chunk)?;
            errors.extend(values.into_iter().map(f64::from));
            remaining -= chunk;
        }
        Ok(())
    }

    fn shrinkwrap(&mut self, sigma: f64, threshold: f64, truncate: f64) -> Result<usize> {
        validate_parameters(sigma, threshold)?;
        self.dispatch(Kernel::Magnitude, self.base);
        if sigma == 0.0 {
            self.dispatch(Kernel::CopyReal, self.base);
        } else {
            // Passes alternate real_a -> real_b -> real_a -> real_b.
            for axis in 0..3u32 {
                self.dispatch(
                    Kernel::BlurAxis,
                    Params {
                        axis,
                        src_b: axis % 2,
                        sigma: sigma as f32,
                        radius: kernel_radius(self.shape[axis as usize], sigma, truncate) as u32,
                        ..self.base
                    },
                );
            }
        }
        self.dispatch(Kernel::ReduceMax, self.base);
        self.dispatch(
            Kernel::ThresholdSupport,
            Params {
                threshold: threshold as f32,
                ..self.base
            },
        );
        self.dispatch(Kernel::ReduceCount, self.base);
        let count = self.read_back(&self.stats, 1, 1)?;
        Ok(count.first().map_or(0, |&c| c.round() as usize))
    }

    fn snapshot(&self) -> Result<(Array3<Complex64>, Array3<f64>)> {
        let total = self.base.total as usize;
        let dim = (self.shape[0], self.shape[1], self.shape[2]);
        let raw = self.read_back(&self.estimate, 0, 2 * total)?;
        let image = Array3::from_shape_vec(
            dim,
            raw.chunks_exact(2)
                .map(|pair| Complex64::new(f64::from(pair[0]), f64::from(pair[1])))
                .collect(),
        )
        .map_err(|err| PhaseError::device(err.to_string()))?;
        let support = Array3::from_shape_vec(
            dim,
            self.read_back(&self.support, 0, total)?
                .into_iter()
                .map(f64::from)
                .collect(),
        )
        .map_err(|err| PhaseError::device(err.to_string()))?;
        Ok((image, support))
    }
}
