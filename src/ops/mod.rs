//! # Kernel Backends
//!
//! Implementations of [`Backend`](crate::backend::Backend).
//!
//! ## Submodules
//!
//! - [`cpu`]: Multi-threaded CPU kernels (the reference and fallback)
//! - [`wgpu`] *(opt-in)*: GPU compute shader pipelines using `wgpu`
//! - [`dispatch`]: Backend construction with CPU fallback
//!
//! ## Extending the Backend
//!
//! To accelerate another primitive:
//!
//! 1. Implement the kernel in the accelerated backend
//! 2. Keep the shape and dtype checks identical to [`cpu`]
//! 3. Compare against the CPU backend in the parity tests
//!
//! ## Feature Flags
//!
//! - `wgpu`: Enables the `wgpu` (WebGPU) backend

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;
