//! Recorded kernel invocations and their deferred gradients.

use crate::backend::{BinaryOp, MatrixOrientation, PoolKind, UnaryOp};
use crate::conv_util::Conv2DInfo;
use crate::error::Result;
use crate::math::Math;
use crate::ndarray::NDArray;

/// Position of a node on its tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// Kernel-specific arguments kept for inspection and replay.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArgs {
    /// The kernel takes no arguments.
    None,
    /// Elementwise unary kernel.
    Unary(UnaryOp),
    /// Elementwise binary kernel.
    Binary(BinaryOp),
    /// Clamp to `[min, max]`.
    Clip {
        /// Lower bound.
        min: f32,
        /// Upper bound.
        max: f32,
    },
    /// Matrix product.
    MatMul {
        /// Orientation of the left operand.
        a: MatrixOrientation,
        /// Orientation of the right operand.
        b: MatrixOrientation,
    },
    /// Sum reduction.
    Sum {
        /// Reduced axis; `None` sums everything.
        axis: Option<usize>,
    },
    /// Concatenation of two arrays.
    Concat {
        /// Joined axis.
        axis: usize,
    },
    /// Contiguous sub-block.
    Slice {
        /// Start index per axis.
        begin: Vec<usize>,
        /// Extent per axis.
        size: Vec<usize>,
    },
    /// Recorded reshape.
    Reshape {
        /// Shape of the input.
        from: Vec<usize>,
    },
    /// Pooling or one of its backprops.
    Pool {
        /// Max or average.
        kind: PoolKind,
        /// Window geometry.
        info: Conv2DInfo,
    },
}

/// A deferred gradient computation for one input.
///
/// Nothing runs until [`compute`](Self::compute) is called, so gradients of
/// inputs nobody asked for are never evaluated.
pub struct GradientThunk(Box<dyn FnOnce(&Math) -> Result<NDArray>>);

impl GradientThunk {
    /// Wraps a gradient computation.
    pub fn new(f: impl FnOnce(&Math) -> Result<NDArray> + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Runs the computation.
    ///
    /// # Errors
    ///
    /// Whatever the underlying kernels report.
    pub fn compute(self, math: &Math) -> Result<NDArray> {
        (self.0)(math)
    }
}

impl core::fmt::Debug for GradientThunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("GradientThunk")
    }
}

/// Per-input gradient thunks, keyed by input name.
#[derive(Debug, Default)]
pub struct InputGradients(Vec<(&'static str, GradientThunk)>);

impl InputGradients {
    /// No gradients.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Adds the thunk for input `name`.
    #[must_use]
    pub fn with(mut self, name: &'static str, f: impl FnOnce(&Math) -> Result<NDArray> + 'static) -> Self {
        self.0.push((name, GradientThunk::new(f)));
        self
    }

    /// Removes and returns the thunk for `name`.
    pub fn take(&mut self, name: &str) -> Option<GradientThunk> {
        let at = self.0.iter().position(|(n, _)| *n == name)?;
        Some(self.0.remove(at).1)
    }

    /// Input names that have a thunk.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|(n, _)| *n)
    }
}

/// Computes the input gradients from `(dy, y)`.
pub type GradientFn = Box<dyn Fn(&NDArray, &NDArray) -> InputGradients>;

/// One recorded kernel invocation.
pub struct KernelNode {
    /// Kernel name.
    pub name: &'static str,
    /// Named inputs, in call order.
    pub inputs: Vec<(&'static str, NDArray)>,
    /// Kernel arguments.
    pub args: KernelArgs,
    /// Output of the invocation.
    pub output: NDArray,
    pub(crate) gradient: GradientFn,
}

impl KernelNode {
    /// Creates a node.
    pub fn new(
        name: &'static str,
        inputs: Vec<(&'static str, NDArray)>,
        args: KernelArgs,
        output: NDArray,
        gradient: impl Fn(&NDArray, &NDArray) -> InputGradients + 'static,
    ) -> Self {
        Self {
            name,
            inputs,
            args,
            output,
            gradient: Box::new(gradient),
        }
    }

    /// Input registered under `name`.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&NDArray> {
        self.inputs.iter().find(|(n, _)| *n == name).map(|(_, a)| a)
    }
}

impl core::fmt::Debug for KernelNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelNode")
            .field("name", &self.name)
            .field(
                "inputs",
                &self.inputs.iter().map(|(n, a)| (*n, a.id())).collect::<Vec<_>>(),
            )
            .field("args", &self.args)
            .field("output", &self.output.id())
            .finish_non_exhaustive()
    }
}
