//! Backend selection and the primitive-kernel contract.
//!
//! This module defines the available computation backends, the global
//! default used by [`Math::new`](crate::math::Math::new), and the
//! [`Backend`] trait every executor implements.
//!
//! # Supported Backends
//!
//! - `Cpu`: Pure Rust backend parallelised with `rayon` (default).
//! - `Wgpu`: GPU-accelerated backend using `wgpu` compute shaders
//!   (requires the `wgpu` feature).
//!
//! The default is stored globally using an `AtomicU8`, enabling fast
//! switching between CPU and GPU modes at runtime. A `Math` context owns its
//! backend, so switching the default never affects a running context.
//!
//! A backend executes one primitive on its input arrays and returns the
//! raw result. It knows nothing about gradients, scopes or the tape; the
//! [`math`](crate::math) layer wraps every [`KernelOutput`] into a tracked
//! array and records the gradient.

use crate::conv_util::Conv2DInfo;
use crate::error::{Error, Result};
use crate::ndarray::{DType, DeviceResource, NDArray};
use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BackendKind {
    /// Pure CPU-based backend (default).
    #[default]
    Cpu = 0,
    /// GPU-accelerated backend using `wgpu`.
    Wgpu,
}

impl TryFrom<u8> for BackendKind {
    type Error = ();

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

/// Internal global state for the default backend.
///
/// Relaxed use is fine: the value only changes between sessions.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(BackendKind::Cpu as u8);

/// Sets the backend new `Math` contexts use by default.
///
/// # Example
///
/// ```
/// use ndtape::backend::{set_backend, get_backend, BackendKind};
/// set_backend(BackendKind::Cpu);
/// assert_eq!(get_backend(), BackendKind::Cpu);
/// ```
pub fn set_backend(b: BackendKind) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the current default backend.
///
/// If the stored value is invalid, defaults to [`BackendKind::Cpu`].
pub fn get_backend() -> BackendKind {
    BackendKind::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

/// Elementwise single-operand kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UnaryOp {
    /// `-x`
    Neg = 0,
    /// `e^x`
    Exp,
    /// `ln x`
    Log,
    /// `√x`
    Sqrt,
    /// `x²`
    Square,
    /// `1 / (1 + e^-x)`
    Sigmoid,
    /// `tanh x`
    Tanh,
    /// `max(x, 0)`
    Relu,
    /// `⌊x⌋`
    Floor,
    /// `1` where `x > 0`, else `0`.
    Step,
    /// `|x|`
    Abs,
}

impl UnaryOp {
    /// Whether the kernel only makes sense on floats.
    #[must_use]
    pub const fn float_only(self) -> bool {
        !matches!(self, Self::Neg | Self::Square | Self::Relu | Self::Floor | Self::Step | Self::Abs)
    }

    /// Output dtype for an operand of type `x`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean operands.
    pub fn output_dtype(self, x: DType) -> Result<DType> {
        match x {
            DType::Bool => Err(Error::UnsupportedType {
                op: self.name(),
                dtype: x,
            }),
            _ if self.float_only() || self == Self::Step => Ok(DType::F32),
            _ => Ok(x),
        }
    }

    /// Applies the kernel to one value; the reference for every backend.
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Neg => -x,
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Sqrt => x.sqrt(),
            Self::Square => x * x,
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Relu => x.max(0.0),
            Self::Floor => x.floor(),
            Self::Step => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Abs => x.abs(),
        }
    }

    /// Name used in errors and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Square => "square",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::Floor => "floor",
            Self::Step => "step",
            Self::Abs => "abs",
        }
    }
}

/// Elementwise two-operand kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BinaryOp {
    /// `a + b`
    Add = 0,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
    /// Larger of `a` and `b`.
    Maximum,
    /// Smaller of `a` and `b`.
    Minimum,
}

impl BinaryOp {
    /// Applies the kernel to one pair.
    #[must_use]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Maximum => a.max(b),
            Self::Minimum => a.min(b),
        }
    }

    /// Name used in errors and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Maximum => "maximum",
            Self::Minimum => "minimum",
        }
    }

    /// Output dtype for operands of type `a` and `b`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean operands.
    pub fn output_dtype(self, a: DType, b: DType) -> Result<DType> {
        let dtype = a.upcast(b, self.name())?;
        Ok(if self == Self::Div { DType::F32 } else { dtype })
    }
}

/// Reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum of elements.
    Sum,
    /// Largest element.
    Max,
}

/// Whether a matmul operand is read as stored or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixOrientation {
    /// Use the matrix as stored.
    #[default]
    Regular,
    /// Use the transpose of the stored matrix.
    Transposed,
}

impl MatrixOrientation {
    /// The other orientation.
    #[must_use]
    pub const fn flip(self) -> Self {
        match self {
            Self::Regular => Self::Transposed,
            Self::Transposed => Self::Regular,
        }
    }
}

/// Pooling reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Maximum over the window.
    Max,
    /// Mean over the valid positions of the window.
    Avg,
}

/// Raw result storage of a kernel.
pub enum Buffer {
    /// Host memory.
    Host(Vec<f32>),
    /// Device memory owned by the backend that produced it.
    Device(Box<dyn DeviceResource>),
}

/// Output of a kernel before the math layer adopts it as an array.
pub struct KernelOutput {
    /// Output dimensions.
    pub shape: Vec<usize>,
    /// Output dtype.
    pub dtype: DType,
    /// Output data.
    pub buffer: Buffer,
}

impl KernelOutput {
    /// A host-resident result.
    #[must_use]
    pub const fn host(shape: Vec<usize>, dtype: DType, data: Vec<f32>) -> Self {
        Self {
            shape,
            dtype,
            buffer: Buffer::Host(data),
        }
    }
}

/// Rejects dtypes a kernel cannot handle.
///
/// # Errors
///
/// [`Error::UnsupportedType`] if `x` is not one of `allowed`.
pub fn check_dtype(op: &'static str, x: &NDArray, allowed: &[DType]) -> Result<()> {
    if allowed.contains(&x.dtype()) {
        Ok(())
    } else {
        Err(Error::UnsupportedType { op, dtype: x.dtype() })
    }
}

/// Logical `(m, k, n)` of `op(a) · op(b)`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] unless both operands are matrices with matching
/// inner dimensions.
pub fn matmul_dims(
    a: &[usize],
    b: &[usize],
    a_orientation: MatrixOrientation,
    b_orientation: MatrixOrientation,
) -> Result<(usize, usize, usize)> {
    let ([ar, ac], [br, bc]) = (a, b) else {
        return Err(Error::shape("matmul", a, b));
    };
    let (m, k) = match a_orientation {
        MatrixOrientation::Regular => (*ar, *ac),
        MatrixOrientation::Transposed => (*ac, *ar),
    };
    let (k2, n) = match b_orientation {
        MatrixOrientation::Regular => (*br, *bc),
        MatrixOrientation::Transposed => (*bc, *br),
    };
    if k != k2 {
        return Err(Error::shape("matmul", a, b));
    }
    Ok((m, k, n))
}

/// A pluggable executor of primitive tensor kernels.
///
/// Any implementation is substitutable under [`Math`](crate::math::Math)
/// without changing the composite layer. Results must agree with the CPU
/// reference within floating-point tolerance.
pub trait Backend {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Makes `x` resident on the device. The CPU backend does nothing.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] or a transfer failure.
    fn upload(&self, x: &NDArray) -> Result<()> {
        let _ = x;
        Ok(())
    }

    /// Elementwise unary kernel.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for non-float input to float-only kernels.
    fn unary(&self, op: UnaryOp, x: &NDArray) -> Result<KernelOutput>;

    /// Elementwise binary kernel with the broadcast rules of
    /// [`Broadcast`](crate::ndarray::shape::Broadcast).
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`], [`Error::UnsupportedType`].
    fn binary(&self, op: BinaryOp, a: &NDArray, b: &NDArray) -> Result<KernelOutput>;

    /// Clamps every element into `[min, max]`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] for boolean input.
    fn clip(&self, x: &NDArray, min: f32, max: f32) -> Result<KernelOutput>;

    /// `op(a) · op(b)` on float matrices.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`], [`Error::UnsupportedType`].
    fn matmul(
        &self,
        a: &NDArray,
        b: &NDArray,
        a_orientation: MatrixOrientation,
        b_orientation: MatrixOrientation,
    ) -> Result<KernelOutput>;

    /// Reduces over all elements (`axis = None`) or one axis.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for an axis past the rank.
    fn reduce(&self, op: ReduceOp, x: &NDArray, axis: Option<usize>) -> Result<KernelOutput>;

    /// Index of the largest element along the last axis.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for scalars or empty axes.
    fn arg_max(&self, x: &NDArray) -> Result<KernelOutput>;

    /// Joins two arrays along `axis`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`].
    fn concat(&self, a: &NDArray, b: &NDArray, axis: usize) -> Result<KernelOutput>;

    /// Copies the window `[begin, begin + size)`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`].
    fn slice(&self, x: &NDArray, begin: &[usize], size: &[usize]) -> Result<KernelOutput>;

    /// Encodes integral indices as `[n, depth]` rows.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`] for any index outside `[0, depth)`.
    fn one_hot(&self, indices: &NDArray, depth: usize, on: f32, off: f32) -> Result<KernelOutput>;

    /// Forward pooling over NHWC input.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when `x` does not match `info`.
    fn pool(&self, kind: PoolKind, x: &NDArray, info: &Conv2DInfo) -> Result<KernelOutput>;

    /// Gradient of pooling with respect to its input.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when `dy` or `x` do not match `info`.
    fn pool_backprop(
        &self,
        kind: PoolKind,
        dy: &NDArray,
        x: &NDArray,
        info: &Conv2DInfo,
    ) -> Result<KernelOutput>;

    /// Reads `values` (shaped like `x`) at the argmax position of each max
    /// pooling window of `x`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when the operands do not match `info`.
    fn max_pool_positions(&self, values: &NDArray, x: &NDArray, info: &Conv2DInfo) -> Result<KernelOutput>;

    /// Draws `num_samples` category indices per row of `probs`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDistribution`] for negative or non-finite weights or a
    /// zero total.
    fn multinomial(
        &self,
        probs: &NDArray,
        num_samples: usize,
        rng: &mut dyn rand::RngCore,
    ) -> Result<KernelOutput>;
}
