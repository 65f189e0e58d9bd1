//! Backend construction with CPU fallback.
//!
//! The requested backend is tried first; if it cannot be created (feature
//! disabled, no adapter, shader failure) the CPU backend is used instead.
//!
//! # Example
//! ```rust
//! use ndtape::backend::BackendKind;
//! use ndtape::ops::dispatch::create_backend;
//!
//! let backend = create_backend(BackendKind::Cpu);
//! assert_eq!(backend.kind(), BackendKind::Cpu);
//! ```

use super::cpu::CpuBackend;
use crate::backend::{Backend, BackendKind};
use crate::error::Result;

/// Creates the requested backend, failing instead of falling back.
///
/// # Errors
///
/// [`Error::DeviceUnavailable`](crate::error::Error::DeviceUnavailable) when the backend cannot run on this machine
/// or build.
pub fn try_create_backend(kind: BackendKind) -> Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Cpu => Ok(Box::new(CpuBackend::new())),
        BackendKind::Wgpu => {
            #[cfg(feature = "wgpu")]
            {
                Ok(Box::new(super::wgpu::WgpuBackend::new()?))
            }
            #[cfg(not(feature = "wgpu"))]
            {
                Err(crate::error::Error::DeviceUnavailable(
                    "built without the `wgpu` feature".into(),
                ))
            }
        }
    }
}

/// Creates the requested backend, or the CPU backend if it is unavailable.
#[must_use]
pub fn create_backend(kind: BackendKind) -> Box<dyn Backend> {
    match try_create_backend(kind) {
        Ok(backend) => backend,
        Err(e) => {
            log::warn!("{kind:?} backend unavailable ({e}); falling back to CPU");
            Box::new(CpuBackend::new())
        }
    }
}
