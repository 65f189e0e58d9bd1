//! GPU-accelerated kernels using WGPU.
//!
//! This module handles GPU context initialization, shader validation and
//! compilation, and compute dispatch. Elementwise maps, broadcast binary
//! ops, clipping and matmul run as WGSL compute shaders and leave their
//! results on the device; reading them back happens only at transfer points
//! ([`NDArray::data`]). Every other primitive falls back to the CPU kernels
//! after downloading its operands.
//!
//! The context is created once, lazily. A machine without a usable adapter
//! yields [`Error::DeviceUnavailable`] instead of a panic.

mod kernels;

use crate::backend::{
    Backend, BackendKind, BinaryOp, Buffer, KernelOutput, MatrixOrientation, PoolKind, ReduceOp,
    UnaryOp, check_dtype, matmul_dims,
};
use crate::conv_util::Conv2DInfo;
use crate::error::{Error, Result};
use crate::ndarray::shape::{Broadcast, size_of};
use crate::ndarray::{DType, DeviceResource, NDArray};
use crate::ops::cpu::CpuBackend;
use briny::prelude::*;
use core::any::Any;
use std::sync::Arc;
use wgpu::util::DeviceExt;

const UNARY: &str = include_str!("shaders/unary.wgsl");
const BINARY: &str = include_str!("shaders/binary.wgsl");
const MATMUL: &str = include_str!("shaders/matmul.wgsl");

/// Basic wrapper for common GPU errors.
#[derive(Debug)]
pub enum GpuError {
    /// An error in requesting the adapter.
    Adapter(wgpu::RequestAdapterError),
    /// An error in requesting the device.
    Device(wgpu::RequestDeviceError),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adapter(e) => write!(f, "adapter error: {e}"),
            Self::Device(e) => write!(f, "device error: {e}"),
        }
    }
}

/// Reasons a kernel could not run on the GPU.
#[derive(Debug)]
pub enum GpuFailure {
    /// A shader failed the source check.
    Validation(&'static str),
    /// A buffer could not be mapped or the device could not be polled.
    Transfer(String),
}

impl std::fmt::Display for GpuFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(label) => write!(f, "shader `{label}` failed validation"),
            Self::Transfer(msg) => write!(f, "transfer failed: {msg}"),
        }
    }
}

impl From<GpuFailure> for Error {
    fn from(failure: GpuFailure) -> Self {
        Self::Gpu(failure.to_string())
    }
}

/// Holds the WGPU device and queue used for executing compute pipelines.
///
/// Initialized once globally and reused for all operations via `lazy_static`.
pub struct GpuContext {
    /// The GPU device.
    pub device: wgpu::Device,
    /// Submission queue of the device.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device and queue.
    ///
    /// Uses `pollster::block_on` to wait for the async WGPU calls.
    ///
    /// # Errors
    ///
    /// [`GpuError`] if adapter or device acquisition fails.
    pub fn new() -> core::result::Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .map_err(GpuError::Adapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("ndtape"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;
        log::info!("GPU context ready on {:?}", adapter.get_info().name);
        Ok(Self { device, queue })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: core::result::Result<GpuContext, GpuError> = GpuContext::new();
}

/// The shared GPU context.
///
/// # Errors
///
/// [`Error::DeviceUnavailable`] when no adapter or device could be acquired.
pub fn context() -> Result<&'static GpuContext> {
    GPU_CONTEXT
        .as_ref()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))
}

/// Wrapper for WGSL source code checked before compilation.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        let src = self.0;
        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }
        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Validates a WGSL shader and compiles it on `device`.
///
/// # Errors
///
/// [`GpuFailure::Validation`] if the source fails the check.
pub fn load_shader(
    device: &wgpu::Device,
    label: &'static str,
    source: &str,
) -> core::result::Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source)
        .validate()
        .map_err(|_| GpuFailure::Validation(label))?;
    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

/// A device buffer of `f32` values.
pub struct GpuBuffer {
    buffer: Arc<wgpu::Buffer>,
    len: usize,
}

impl GpuBuffer {
    /// Uploads host data into a new storage buffer.
    pub(crate) fn upload(ctx: &GpuContext, data: &[f32]) -> Self {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        let buffer = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("ndtape_upload"),
            contents: &bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        });
        Self {
            buffer: Arc::new(buffer),
            len: data.len(),
        }
    }

    /// An uninitialised output buffer.
    pub(crate) fn output(ctx: &GpuContext, len: usize) -> Self {
        let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ndtape_output"),
            size: (len * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self {
            buffer: Arc::new(buffer),
            len,
        }
    }

    pub(crate) fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

impl DeviceResource for GpuBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self) -> Result<Vec<f32>> {
        let ctx = context()?;
        pollster::block_on(read_buffer(ctx, &self.buffer, self.len)).map_err(Error::from)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Copies a storage buffer into a staging buffer and maps it for reading.
async fn read_buffer(
    ctx: &GpuContext,
    buffer: &wgpu::Buffer,
    len: usize,
) -> core::result::Result<Vec<f32>, GpuFailure> {
    let size = (len * 4) as u64;
    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("ndtape_staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("ndtape_readback"),
        });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
    ctx.queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    ctx.device
        .poll(wgpu::PollType::Wait)
        .map_err(|e| GpuFailure::Transfer(e.to_string()))?;
    rx.recv()
        .map_err(|e| GpuFailure::Transfer(e.to_string()))?
        .map_err(|e| GpuFailure::Transfer(e.to_string()))?;

    let data = slice.get_mapped_range();
    let out = data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    drop(data);
    staging.unmap();
    Ok(out)
}

/// Backend running the elementwise and matmul families on the GPU.
pub struct WgpuBackend {
    ctx: &'static GpuContext,
    pipelines: kernels::Pipelines,
    cpu: CpuBackend,
}

impl WgpuBackend {
    /// Acquires the GPU and compiles the shaders.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceUnavailable`] without a usable adapter, [`Error::Gpu`]
    /// if a shader fails validation.
    pub fn new() -> Result<Self> {
        let ctx = context()?;
        let pipelines = kernels::Pipelines::new(&ctx.device)?;
        Ok(Self {
            ctx,
            pipelines,
            cpu: CpuBackend::new(),
        })
    }

    /// Device copy of `x`, uploading the host data first if needed.
    fn device_buffer(&self, x: &NDArray) -> Result<Arc<wgpu::Buffer>> {
        let resident = x.handle().with_device(|d| {
            d.and_then(|r| r.as_any().downcast_ref::<GpuBuffer>())
                .map(|g| Arc::clone(&g.buffer))
        })?;
        if let Some(buffer) = resident {
            return Ok(buffer);
        }
        let upload = x.handle().with_host(|d| GpuBuffer::upload(self.ctx, d))?;
        let buffer = Arc::clone(&upload.buffer);
        x.handle().attach_device(Box::new(upload))?;
        Ok(buffer)
    }

    fn cpu_fallback(&self, op: &'static str) -> &CpuBackend {
        log::debug!("`{op}` has no GPU kernel; running on the CPU");
        &self.cpu
    }
}

impl Backend for WgpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wgpu
    }

    fn upload(&self, x: &NDArray) -> Result<()> {
        self.device_buffer(x).map(drop)
    }

    fn unary(&self, op: UnaryOp, x: &NDArray) -> Result<KernelOutput> {
        let dtype = op.output_dtype(x.dtype())?;
        if x.size() == 0 || x.size() > kernels::MAX_LINEAR_LEN {
            return self.cpu.unary(op, x);
        }
        let input = self.device_buffer(x)?;
        let out = self.pipelines.unary(self.ctx, op as u32, [0.0, 0.0], &input, x.size());
        Ok(KernelOutput {
            shape: x.shape().to_vec(),
            dtype,
            buffer: Buffer::Device(Box::new(out)),
        })
    }

    fn binary(&self, op: BinaryOp, a: &NDArray, b: &NDArray) -> Result<KernelOutput> {
        let dtype = op.output_dtype(a.dtype(), b.dtype())?;
        let (rule, shape) = Broadcast::resolve(op.name(), a.shape(), b.shape())?;
        let len = size_of(&shape);
        if len == 0 || len > kernels::MAX_LINEAR_LEN {
            return self.cpu.binary(op, a, b);
        }
        let (lhs, rhs) = (self.device_buffer(a)?, self.device_buffer(b)?);
        let out = self.pipelines.binary(self.ctx, op, rule, &lhs, &rhs, len);
        Ok(KernelOutput {
            shape,
            dtype,
            buffer: Buffer::Device(Box::new(out)),
        })
    }

    fn clip(&self, x: &NDArray, min: f32, max: f32) -> Result<KernelOutput> {
        check_dtype("clip", x, &[DType::F32, DType::I32])?;
        if min.is_nan() || max.is_nan() || min > max || x.size() == 0 || x.size() > kernels::MAX_LINEAR_LEN {
            return self.cpu.clip(x, min, max);
        }
        let input = self.device_buffer(x)?;
        let out = self.pipelines.unary(self.ctx, kernels::CLIP_OP, [min, max], &input, x.size());
        Ok(KernelOutput {
            shape: x.shape().to_vec(),
            dtype: x.dtype(),
            buffer: Buffer::Device(Box::new(out)),
        })
    }

    fn matmul(
        &self,
        a: &NDArray,
        b: &NDArray,
        a_orientation: MatrixOrientation,
        b_orientation: MatrixOrientation,
    ) -> Result<KernelOutput> {
        check_dtype("matmul", a, &[DType::F32])?;
        check_dtype("matmul", b, &[DType::F32])?;
        let dims = matmul_dims(a.shape(), b.shape(), a_orientation, b_orientation)?;
        let (m, k, n) = dims;
        if m * n == 0 || k == 0 || m.max(n) > kernels::MAX_MATMUL_SIDE {
            return self.cpu.matmul(a, b, a_orientation, b_orientation);
        }
        let (lhs, rhs) = (self.device_buffer(a)?, self.device_buffer(b)?);
        let out = self
            .pipelines
            .matmul(self.ctx, dims, a_orientation, b_orientation, &lhs, &rhs);
        Ok(KernelOutput {
            shape: vec![dims.0, dims.2],
            dtype: DType::F32,
            buffer: Buffer::Device(Box::new(out)),
        })
    }

    fn reduce(&self, op: ReduceOp, x: &NDArray, axis: Option<usize>) -> Result<KernelOutput> {
        self.cpu_fallback("reduce").reduce(op, x, axis)
    }

    fn arg_max(&self, x: &NDArray) -> Result<KernelOutput> {
        self.cpu_fallback("arg_max").arg_max(x)
    }

    fn concat(&self, a: &NDArray, b: &NDArray, axis: usize) -> Result<KernelOutput> {
        self.cpu_fallback("concat").concat(a, b, axis)
    }

    fn slice(&self, x: &NDArray, begin: &[usize], size: &[usize]) -> Result<KernelOutput> {
        self.cpu_fallback("slice").slice(x, begin, size)
    }

    fn one_hot(&self, indices: &NDArray, depth: usize, on: f32, off: f32) -> Result<KernelOutput> {
        self.cpu_fallback("one_hot").one_hot(indices, depth, on, off)
    }

    fn pool(&self, kind: PoolKind, x: &NDArray, info: &Conv2DInfo) -> Result<KernelOutput> {
        self.cpu_fallback("pool").pool(kind, x, info)
    }

    fn pool_backprop(
        &self,
        kind: PoolKind,
        dy: &NDArray,
        x: &NDArray,
        info: &Conv2DInfo,
    ) -> Result<KernelOutput> {
        self.cpu_fallback("pool_backprop").pool_backprop(kind, dy, x, info)
    }

    fn max_pool_positions(&self, values: &NDArray, x: &NDArray, info: &Conv2DInfo) -> Result<KernelOutput> {
        self.cpu_fallback("max_pool_positions")
            .max_pool_positions(values, x, info)
    }

    fn multinomial(
        &self,
        probs: &NDArray,
        num_samples: usize,
        rng: &mut dyn rand::RngCore,
    ) -> Result<KernelOutput> {
        self.cpu_fallback("multinomial")
            .multinomial(probs, num_samples, rng)
    }
}
