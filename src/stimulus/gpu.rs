//! GPU compute backend for stimulus rendering (`gpu` feature).
//!
//! Runs the same bar/checkerboard evaluation as [`CpuRenderer`] as a wgpu
//! compute kernel over the precomputed spherical tables. The CPU renderer
//! remains the reference; the kernel consumes the identical tables and the
//! identical pre-quantized luminance levels, so outputs agree except for
//! f32-vs-f64 rounding at checker cell boundaries. Any GPU failure at
//! render time falls back to the CPU path for that frame.

use ndarray::Array2;
use std::sync::Mutex;
use wgpu::util::DeviceExt;

use crate::error::{AppResult, IsiError};
use crate::stimulus::generator::{CpuRenderer, FrameRenderer, RenderRequest};

const WORKGROUP_SIZE: u32 = 256;

const SHADER: &str = r#"
struct Params {
    bar_angle: f32,
    half_bar: f32,
    checker_size: f32,
    background: f32,
    bright: f32,
    dark: f32,
    azimuth_bar: u32,
    show_bar: u32,
    polarity: u32,
    width: u32,
    height: u32,
    _pad: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> azimuth: array<f32>;
@group(0) @binding(2) var<storage, read> altitude: array<f32>;
@group(0) @binding(3) var<storage, read_write> out_pixels: array<u32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x;
    if (idx >= params.width * params.height) {
        return;
    }
    var value = params.background;
    if (params.show_bar != 0u) {
        let az = azimuth[idx];
        let alt = altitude[idx];
        let along = select(alt, az, params.azimuth_bar != 0u);
        if (abs(along - params.bar_angle) <= params.half_bar) {
            let cell = i32(floor(az / params.checker_size))
                + i32(floor(alt / params.checker_size));
            var light = ((cell % 2) + 2) % 2 == 0;
            if (params.polarity != 0u) {
                light = !light;
            }
            value = select(params.dark, params.bright, light);
        }
    }
    out_pixels[idx] = u32(value);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct KernelParams {
    bar_angle: f32,
    half_bar: f32,
    checker_size: f32,
    background: f32,
    bright: f32,
    dark: f32,
    azimuth_bar: u32,
    show_bar: u32,
    polarity: u32,
    width: u32,
    height: u32,
    _pad: u32,
}

struct GpuState {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
}

/// wgpu compute renderer with CPU fallback.
pub struct GpuRenderer {
    state: Mutex<GpuState>,
    fallback: CpuRenderer,
}

impl GpuRenderer {
    /// Acquire an adapter and build the compute pipeline. Fails cleanly when
    /// no usable GPU is present, in which case the caller keeps the CPU
    /// renderer.
    pub fn new() -> AppResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| IsiError::Internal("no wgpu adapter available".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("stimulus-renderer"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .map_err(|e| IsiError::Internal(format!("wgpu device: {e}")))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("stimulus-kernel"),
            source: wgpu::ShaderSource::Wgsl(SHADER.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("stimulus-pipeline"),
            layout: None,
            module: &shader,
            entry_point: "main",
            compilation_options: Default::default(),
            cache: None,
        });

        tracing::info!(adapter = %adapter.get_info().name, "GPU stimulus renderer ready");
        Ok(Self {
            state: Mutex::new(GpuState {
                device,
                queue,
                pipeline,
            }),
            fallback: CpuRenderer,
        })
    }

    fn render_gpu(&self, request: &RenderRequest<'_>) -> AppResult<Array2<u8>> {
        let state = self
            .state
            .lock()
            .map_err(|_| IsiError::Internal("gpu state poisoned".into()))?;
        let screen = request.screen;
        let stim = request.stimulus;
        let total = screen.width_px * screen.height_px;

        let quantize = |l: f64| (l.clamp(0.0, 1.0) * 255.0).round() as f32;
        let amplitude = stim.contrast
            * stim
                .background_luminance
                .min(1.0 - stim.background_luminance);
        let params = KernelParams {
            bar_angle: request.bar_angle_deg as f32,
            half_bar: (stim.bar_width_deg / 2.0) as f32,
            checker_size: stim.checker_size_deg as f32,
            background: quantize(stim.background_luminance),
            bright: quantize(stim.background_luminance + amplitude),
            dark: quantize(stim.background_luminance - amplitude),
            azimuth_bar: request.azimuth_bar as u32,
            show_bar: request.show_bar as u32,
            polarity: request.checker_polarity as u32,
            width: screen.width_px as u32,
            height: screen.height_px as u32,
            _pad: 0,
        };

        let az: Vec<f32> = screen.azimuth_deg.iter().map(|&v| v as f32).collect();
        let alt: Vec<f32> = screen.altitude_deg.iter().map(|&v| v as f32).collect();

        let device = &state.device;
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let az_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("azimuth-table"),
            contents: bytemuck::cast_slice(&az),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let alt_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("altitude-table"),
            contents: bytemuck::cast_slice(&alt),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let out_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pixels-out"),
            size: (total * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pixels-staging"),
            size: (total * 4) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("stimulus-bindings"),
            layout: &state.pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: az_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: alt_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: out_buf.as_entire_binding(),
                },
            ],
        });

        let mut encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("stimulus"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&state.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups((total as u32).div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        encoder.copy_buffer_to_buffer(&out_buf, 0, &staging, 0, (total * 4) as u64);
        state.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        state.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| IsiError::Internal("gpu readback channel closed".into()))?
            .map_err(|e| IsiError::Internal(format!("gpu readback: {e:?}")))?;

        let words: Vec<u32> = bytemuck::cast_slice(&slice.get_mapped_range()).to_vec();
        staging.unmap();

        let mut frame = Array2::<u8>::zeros((screen.height_px, screen.width_px));
        for (slot, word) in frame.iter_mut().zip(words) {
            *slot = word.min(255) as u8;
        }
        Ok(frame)
    }
}

impl FrameRenderer for GpuRenderer {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn render(&self, request: &RenderRequest<'_>) -> Array2<u8> {
        match self.render_gpu(request) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "gpu render failed, using cpu fallback");
                self.fallback.render(request)
            }
        }
    }
}
