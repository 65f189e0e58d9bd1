//! Parallel CPU backend.
//!
//! The reference implementation of every primitive. Kernels live in
//! per-family submodules and work on plain slices; [`CpuBackend`] validates
//! shapes and dtypes, reads the operands' host data (downloading device
//! copies if needed) and hands back host results.
//!
//! Parallel execution uses [`rayon`](https://docs.rs/rayon). Results are
//! deterministic for deterministic inputs.

pub mod elementwise;
pub mod layout;
pub mod matmul;
pub mod pool;
pub mod reduce;
pub mod sample;

use crate::backend::{
    Backend, BackendKind, BinaryOp, KernelOutput, MatrixOrientation, PoolKind, ReduceOp, UnaryOp,
    check_dtype, matmul_dims,
};
use crate::conv_util::Conv2DInfo;
use crate::error::{Error, Result};
use crate::ndarray::shape::{Broadcast, check_slice, concat_shape, size_of};
use crate::ndarray::{DType, NDArray};

const NUMERIC: &[DType] = &[DType::F32, DType::I32];

fn with2<R>(a: &NDArray, b: &NDArray, f: impl FnOnce(&[f32], &[f32]) -> R) -> Result<R> {
    a.handle().with_host(|a| b.handle().with_host(|b| f(a, b)))?
}

fn check_pool_operand(op: &'static str, x: &NDArray, expected: [usize; 4]) -> Result<()> {
    check_dtype(op, x, &[DType::F32])?;
    if x.shape() == expected {
        Ok(())
    } else {
        Err(Error::shape(op, &expected, x.shape()))
    }
}

/// The CPU reference backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    /// Creates the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Backend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn unary(&self, op: UnaryOp, x: &NDArray) -> Result<KernelOutput> {
        let dtype = op.output_dtype(x.dtype())?;
        let data = x.handle().with_host(|x| elementwise::unary(op, x))?;
        Ok(KernelOutput::host(x.shape().to_vec(), dtype, data))
    }

    fn binary(&self, op: BinaryOp, a: &NDArray, b: &NDArray) -> Result<KernelOutput> {
        let dtype = op.output_dtype(a.dtype(), b.dtype())?;
        let (rule, shape) = Broadcast::resolve(op.name(), a.shape(), b.shape())?;
        let len = size_of(&shape);
        let data = with2(a, b, |a, b| elementwise::binary(op, rule, a, b, len))?;
        Ok(KernelOutput::host(shape, dtype, data))
    }

    fn clip(&self, x: &NDArray, min: f32, max: f32) -> Result<KernelOutput> {
        check_dtype("clip", x, NUMERIC)?;
        if min.is_nan() || max.is_nan() || min > max {
            return Err(Error::InvalidConfig(format!("clip bounds [{min}, {max}] are empty")));
        }
        let data = x.handle().with_host(|x| elementwise::clip(x, min, max))?;
        Ok(KernelOutput::host(x.shape().to_vec(), x.dtype(), data))
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
        let data = with2(a, b, |a, b| matmul::matmul(a, b, dims, a_orientation, b_orientation))?;
        Ok(KernelOutput::host(vec![dims.0, dims.2], DType::F32, data))
    }

    fn reduce(&self, op: ReduceOp, x: &NDArray, axis: Option<usize>) -> Result<KernelOutput> {
        let name = match op {
            ReduceOp::Sum => "sum",
            ReduceOp::Max => "max",
        };
        check_dtype(name, x, NUMERIC)?;
        match axis {
            None => {
                if op == ReduceOp::Max && x.size() == 0 {
                    return Err(Error::shape(name, x.shape(), &[]));
                }
                let value = x.handle().with_host(|x| reduce::reduce_all(op, x))?;
                Ok(KernelOutput::host(Vec::new(), x.dtype(), vec![value]))
            }
            Some(axis) => {
                if axis >= x.rank() {
                    return Err(Error::shape(name, x.shape(), &[axis]));
                }
                if op == ReduceOp::Max && x.shape()[axis] == 0 {
                    return Err(Error::shape(name, x.shape(), &[axis]));
                }
                let mut shape = x.shape().to_vec();
                shape.remove(axis);
                let split = reduce::split_axis(x.shape(), axis);
                let data = x.handle().with_host(|x| reduce::reduce_axis(op, x, split))?;
                Ok(KernelOutput::host(shape, x.dtype(), data))
            }
        }
    }

    fn arg_max(&self, x: &NDArray) -> Result<KernelOutput> {
        check_dtype("arg_max", x, NUMERIC)?;
        let Some((&cols, outer)) = x.shape().split_last() else {
            return Err(Error::shape("arg_max", x.shape(), &[]));
        };
        if cols == 0 {
            return Err(Error::shape("arg_max", x.shape(), &[]));
        }
        let data = x.handle().with_host(|x| reduce::arg_max_rows(x, cols))?;
        Ok(KernelOutput::host(outer.to_vec(), DType::I32, data))
    }

    fn concat(&self, a: &NDArray, b: &NDArray, axis: usize) -> Result<KernelOutput> {
        let shape = concat_shape(a.shape(), b.shape(), axis)?;
        let dtype = if a.dtype() == b.dtype() {
            a.dtype()
        } else {
            a.dtype().upcast(b.dtype(), "concat")?
        };
        let data = with2(a, b, |ad, bd| layout::concat(ad, a.shape(), bd, b.shape(), axis))?;
        Ok(KernelOutput::host(shape, dtype, data))
    }

    fn slice(&self, x: &NDArray, begin: &[usize], size: &[usize]) -> Result<KernelOutput> {
        check_slice(x.shape(), begin, size)?;
        let data = x.handle().with_host(|d| layout::slice(d, x.shape(), begin, size))?;
        Ok(KernelOutput::host(size.to_vec(), x.dtype(), data))
    }

    fn one_hot(&self, indices: &NDArray, depth: usize, on: f32, off: f32) -> Result<KernelOutput> {
        check_dtype("one_hot", indices, NUMERIC)?;
        if indices.rank() > 1 {
            return Err(Error::shape("one_hot", indices.shape(), &[depth]));
        }
        let data = indices.handle().with_host(|i| layout::one_hot(i, depth, on, off))??;
        Ok(KernelOutput::host(vec![indices.size(), depth], DType::F32, data))
    }

    fn pool(&self, kind: PoolKind, x: &NDArray, info: &Conv2DInfo) -> Result<KernelOutput> {
        check_pool_operand("pool", x, info.in_shape())?;
        let data = x.handle().with_host(|x| pool::pool(kind, x, info))?;
        Ok(KernelOutput::host(info.out_shape().to_vec(), DType::F32, data))
    }

    fn pool_backprop(
        &self,
        kind: PoolKind,
        dy: &NDArray,
        x: &NDArray,
        info: &Conv2DInfo,
    ) -> Result<KernelOutput> {
        check_pool_operand("pool_backprop", dy, info.out_shape())?;
        check_pool_operand("pool_backprop", x, info.in_shape())?;
        let data = with2(dy, x, |dy, x| pool::pool_backprop(kind, dy, x, info))?;
        Ok(KernelOutput::host(info.in_shape().to_vec(), DType::F32, data))
    }

    fn max_pool_positions(&self, values: &NDArray, x: &NDArray, info: &Conv2DInfo) -> Result<KernelOutput> {
        check_pool_operand("max_pool_positions", values, info.in_shape())?;
        check_pool_operand("max_pool_positions", x, info.in_shape())?;
        let data = with2(values, x, |v, x| pool::max_pool_positions(v, x, info))?;
        Ok(KernelOutput::host(info.out_shape().to_vec(), DType::F32, data))
    }

    fn multinomial(
        &self,
        probs: &NDArray,
        num_samples: usize,
        rng: &mut dyn rand::RngCore,
    ) -> Result<KernelOutput> {
        check_dtype("multinomial", probs, NUMERIC)?;
        let shape = match probs.shape() {
            [_] => vec![num_samples],
            [rows, _] => vec![*rows, num_samples],
            other => return Err(Error::shape("multinomial", other, &[num_samples])),
        };
        let cols = probs.shape()[probs.rank() - 1];
        if cols == 0 {
            return Err(Error::InvalidDistribution("no categories".into()));
        }
        let data = probs
            .handle()
            .with_host(|p| sample::multinomial(p, cols, num_samples, rng))??;
        Ok(KernelOutput::host(shape, DType::I32, data))
    }
}
