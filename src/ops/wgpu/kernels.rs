//! Compute pipelines and their dispatch.

use super::{BINARY, GpuBuffer, GpuContext, GpuFailure, MATMUL, UNARY, load_shader};
use crate::backend::{BinaryOp, MatrixOrientation};
use crate::ndarray::shape::Broadcast;

/// Op code of clipping in the unary shader.
pub const CLIP_OP: u32 = 11;

const LINEAR_WORKGROUP: u32 = 64;
const TILE: u32 = 8;
const MAX_GROUPS: usize = 65_535;

/// Largest element count a single linear dispatch covers.
pub const MAX_LINEAR_LEN: usize = MAX_GROUPS * LINEAR_WORKGROUP as usize;

/// Largest matmul output side a single dispatch covers.
pub const MAX_MATMUL_SIDE: usize = MAX_GROUPS * TILE as usize;

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Packs uniform words in little-endian order.
fn words(values: [u32; 4]) -> Vec<u8> {
    values.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[allow(clippy::cast_possible_truncation)]
fn to_u32(n: usize) -> u32 {
    n as u32
}

/// One compiled shader with its bind group layout.
///
/// Binding 0 is a 16-byte uniform block, followed by `inputs` read-only
/// storage buffers and one writable output buffer.
struct Kernel {
    label: &'static str,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl Kernel {
    fn new(device: &wgpu::Device, label: &'static str, source: &str, inputs: u32) -> Result<Self, GpuFailure> {
        let module = load_shader(device, label, source)?;
        let mut entries = vec![buffer_entry(0, wgpu::BufferBindingType::Uniform)];
        for binding in 1..=inputs {
            entries.push(buffer_entry(
                binding,
                wgpu::BufferBindingType::Storage { read_only: true },
            ));
        }
        entries.push(buffer_entry(
            inputs + 1,
            wgpu::BufferBindingType::Storage { read_only: false },
        ));
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        Ok(Self {
            label,
            layout,
            pipeline,
        })
    }

    /// Encodes and submits one dispatch. The output stays on the device.
    fn run(
        &self,
        ctx: &GpuContext,
        params: &[u8],
        inputs: &[&wgpu::Buffer],
        out_len: usize,
        workgroups: (u32, u32),
    ) -> GpuBuffer {
        use wgpu::util::DeviceExt;

        let uniform = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(self.label),
            contents: params,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let output = GpuBuffer::output(ctx, out_len);

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        }];
        for (i, buffer) in inputs.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: to_u32(i + 1),
                resource: buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: to_u32(inputs.len() + 1),
            resource: output.raw().as_entire_binding(),
        });
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.layout,
            entries: &entries,
        });

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(self.label),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups.0, workgroups.1, 1);
        }
        ctx.queue.submit(Some(encoder.finish()));
        log::trace!("dispatched `{}` over {out_len} elements", self.label);
        output
    }
}

/// Every pipeline the GPU backend dispatches.
pub struct Pipelines {
    unary: Kernel,
    binary: Kernel,
    matmul: Kernel,
}

impl Pipelines {
    pub fn new(device: &wgpu::Device) -> Result<Self, GpuFailure> {
        Ok(Self {
            unary: Kernel::new(device, "unary", UNARY, 1)?,
            binary: Kernel::new(device, "binary", BINARY, 2)?,
            matmul: Kernel::new(device, "matmul", MATMUL, 2)?,
        })
    }

    /// Elementwise map; `bounds` are only read by [`CLIP_OP`].
    pub fn unary(
        &self,
        ctx: &GpuContext,
        op: u32,
        bounds: [f32; 2],
        x: &wgpu::Buffer,
        len: usize,
    ) -> GpuBuffer {
        let params = words([to_u32(len), op, bounds[0].to_bits(), bounds[1].to_bits()]);
        let groups = to_u32(len).div_ceil(LINEAR_WORKGROUP);
        self.unary.run(ctx, &params, &[x], len, (groups, 1))
    }

    pub fn binary(
        &self,
        ctx: &GpuContext,
        op: BinaryOp,
        rule: Broadcast,
        a: &wgpu::Buffer,
        b: &wgpu::Buffer,
        len: usize,
    ) -> GpuBuffer {
        let (mode, cols) = match rule {
            Broadcast::Same => (0, 0),
            Broadcast::ScalarLhs => (1, 0),
            Broadcast::ScalarRhs => (2, 0),
            Broadcast::RowRhs { cols } => (3, cols),
            Broadcast::RowLhs { cols } => (4, cols),
        };
        let params = words([to_u32(len), op as u32, mode, to_u32(cols)]);
        let groups = to_u32(len).div_ceil(LINEAR_WORKGROUP);
        self.binary.run(ctx, &params, &[a, b], len, (groups, 1))
    }

    pub fn matmul(
        &self,
        ctx: &GpuContext,
        (m, k, n): (usize, usize, usize),
        a_orientation: MatrixOrientation,
        b_orientation: MatrixOrientation,
        a: &wgpu::Buffer,
        b: &wgpu::Buffer,
    ) -> GpuBuffer {
        let mut flags = 0;
        if a_orientation == MatrixOrientation::Transposed {
            flags |= 1;
        }
        if b_orientation == MatrixOrientation::Transposed {
            flags |= 2;
        }
        let params = words([to_u32(m), to_u32(k), to_u32(n), flags]);
        let groups = (to_u32(n).div_ceil(TILE), to_u32(m).div_ceil(TILE));
        self.matmul.run(ctx, &params, &[a, b], m * n, groups)
    }
}
