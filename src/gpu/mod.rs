//! wgpu compute path for batched letterboxing.
//!
//! Enabled with the `gpu` feature. A whole inference batch is recorded into a
//! single command encoder (one dispatch plus one readback copy per frame) and
//! submitted once. The shader writes one packed RGBX word per pixel, so the
//! device buffers hold 4 bytes per output pixel. Output shapes match the CPU
//! path exactly; pixel values can differ by a rounding step because the
//! interpolation runs in f32 on device.

use crate::preprocessing::{LetterboxGeometry, LetterboxResult};
use bytemuck::{Pod, Zeroable};
use image::RgbImage;
use thiserror::Error;
use wgpu::util::DeviceExt;

const WORKGROUP_EDGE: u32 = 16;
const SHADER: &str = include_str!("letterbox.wgsl");

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter found")]
    NoAdapter,
    #[error("failed to request GPU device: {0}")]
    DeviceRequest(String),
    #[error("buffer operation failed: {0}")]
    Buffer(String),
}

/// Uniform block; layout must match `Params` in letterbox.wgsl.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LetterboxParams {
    src_w: u32,
    src_h: u32,
    new_w: u32,
    new_h: u32,
    dst_w: u32,
    dst_h: u32,
    pad_left: u32,
    pad_top: u32,
    x_ratio: f32,
    y_ratio: f32,
    _pad0: u32,
    _pad1: u32,
}

pub struct GpuLetterbox {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    adapter_info: wgpu::AdapterInfo,
}

struct PendingFrame {
    geom: LetterboxGeometry,
    staging: wgpu::Buffer,
    // Keep the bound buffers alive until the submission completes
    _src: wgpu::Buffer,
    _dst: wgpu::Buffer,
    _params: wgpu::Buffer,
}

impl GpuLetterbox {
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        let adapter_limits = adapter.limits();
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            ..Default::default()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("vessel-caliper-gpu"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("letterbox"),
            source: wgpu::ShaderSource::Wgsl(SHADER.into()),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("letterbox_layout"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
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
            label: Some("letterbox_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("letterbox"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("letterbox"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            layout,
            adapter_info,
        })
    }

    pub fn device_name(&self) -> String {
        format!(
            "{} ({:?}, {:?})",
            self.adapter_info.name, self.adapter_info.device_type, self.adapter_info.backend
        )
    }

    pub fn letterbox_batch(
        &self,
        frames: &[RgbImage],
        target: (u32, u32),
    ) -> Result<Vec<LetterboxResult>, GpuError> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("letterbox_batch"),
            });

        let mut pending = Vec::with_capacity(frames.len());
        for frame in frames {
            pending.push(self.record_frame(&mut encoder, frame, target)?);
        }

        self.queue.submit(std::iter::once(encoder.finish()));

        let mut results = Vec::with_capacity(pending.len());
        for p in pending {
            let data = self.read_staging(&p.staging)?;
            let image = RgbImage::from_raw(p.geom.target_w, p.geom.target_h, unpack_rgbx(&data))
                .ok_or_else(|| GpuError::Buffer("readback size does not match canvas".to_string()))?;
            results.push(LetterboxResult {
                image,
                scale: p.geom.scale,
                pad_left: p.geom.pad_left,
                pad_top: p.geom.pad_top,
            });
        }

        Ok(results)
    }

    fn record_frame(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        frame: &RgbImage,
        target: (u32, u32),
    ) -> Result<PendingFrame, GpuError> {
        let geom = LetterboxGeometry::compute(frame.width(), frame.height(), target);
        if frame.width() == 0 || frame.height() == 0 {
            return Err(GpuError::Buffer("empty source frame".to_string()));
        }

        // Storage arrays are u32-addressed; pad the byte stream to a word boundary
        let mut bytes = frame.as_raw().clone();
        bytes.resize(bytes.len().div_ceil(4) * 4, 0);

        let src = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("letterbox_src"),
                contents: &bytes,
                usage: wgpu::BufferUsages::STORAGE,
            });

        let out_size = output_bytes(geom.target_w, geom.target_h);
        let dst = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("letterbox_dst"),
            size: out_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("letterbox_staging"),
            size: out_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let params = LetterboxParams {
            src_w: frame.width(),
            src_h: frame.height(),
            new_w: geom.new_w,
            new_h: geom.new_h,
            dst_w: geom.target_w,
            dst_h: geom.target_h,
            pad_left: geom.pad_left as u32,
            pad_top: geom.pad_top as u32,
            x_ratio: frame.width() as f32 / geom.new_w as f32,
            y_ratio: frame.height() as f32 / geom.new_h as f32,
            _pad0: 0,
            _pad1: 0,
        };
        let params_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("letterbox_params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("letterbox_bind_group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: src.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: dst.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("letterbox_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                geom.target_w.div_ceil(WORKGROUP_EDGE),
                geom.target_h.div_ceil(WORKGROUP_EDGE),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&dst, 0, &staging, 0, out_size);

        Ok(PendingFrame {
            geom,
            staging,
            _src: src,
            _dst: dst,
            _params: params_buf,
        })
    }

    fn read_staging(&self, buffer: &wgpu::Buffer) -> Result<Vec<u8>, GpuError> {
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|e| GpuError::Buffer(e.to_string()))?
            .map_err(|e| GpuError::Buffer(e.to_string()))?;

        let data = slice.get_mapped_range();
        let out = data.to_vec();
        drop(data);
        buffer.unmap();
        Ok(out)
    }
}

/// Device bytes for one letterboxed canvas, one packed word per pixel.
fn output_bytes(width: u32, height: u32) -> u64 {
    width as u64 * height as u64 * std::mem::size_of::<u32>() as u64
}

/// Drops the padding byte of each little-endian `0x00BBGGRR` word.
fn unpack_rgbx(words: &[u8]) -> Vec<u8> {
    words
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect()
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::letterbox;
    use image::Rgb;

    #[test]
    fn test_output_is_four_bytes_per_pixel() {
        assert_eq!(output_bytes(1024, 1024), 4 * 1024 * 1024);
        assert_eq!(output_bytes(3, 2), 24);
    }

    #[test]
    fn test_unpack_rgbx_drops_padding() {
        let words = [10u8, 20, 30, 0, 40, 50, 60, 0];
        assert_eq!(unpack_rgbx(&words), vec![10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn test_gpu_matches_cpu_shape_and_values() {
        let Ok(gpu) = GpuLetterbox::new() else {
            eprintln!("no GPU adapter, skipping");
            return;
        };
        let frame = RgbImage::from_fn(97, 41, |x, y| Rgb([(x * 2) as u8, (y * 5) as u8, 77]));
        let gpu_out = gpu.letterbox_batch(&[frame.clone()], (64, 64)).unwrap();
        let cpu_out = letterbox(&frame, (64, 64));

        assert_eq!(gpu_out[0].image.dimensions(), cpu_out.image.dimensions());
        assert_eq!(gpu_out[0].pad_top, cpu_out.pad_top);
        for (a, b) in gpu_out[0].image.iter().zip(cpu_out.image.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 2);
        }
    }
}
