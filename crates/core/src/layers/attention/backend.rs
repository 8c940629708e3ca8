//! Per-call backend dispatch.
//!
//! Each kernel invocation picks between the two implementations from the
//! configured override and where the tensors live. The choice is a tagged
//! enum rather than a trait object: it is made per call, costs a match, and
//! keeps both implementations visible at the call site.

use tracing::debug;

use super::error::AttentionError;
use crate::config::BackendOverride;

/// The two interchangeable kernel implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Portable candle implementation; runs anywhere, bit-stable in f32.
    Reference,
    /// Fused flash-attention kernels; device tensors only.
    Accelerator,
}

/// Whether the accelerator kernels were compiled in.
pub const fn accelerator_compiled() -> bool {
    cfg!(feature = "flash-attn")
}

/// Resolve the backend for one kernel invocation.
///
/// | residency    | override    | chosen                |
/// |--------------|-------------|-----------------------|
/// | device       | auto        | accelerator           |
/// | device       | accelerator | accelerator           |
/// | device       | reference   | reference             |
/// | host         | auto        | reference             |
/// | host         | reference   | reference             |
/// | host         | accelerator | BackendUnavailable    |
///
/// `auto` also falls back to the reference kernel when the accelerator was
/// not compiled in; an explicit `accelerator` override in that situation is
/// an error rather than a silent downgrade.
pub fn resolve(mode: BackendOverride, on_accelerator: bool) -> Result<Backend, AttentionError> {
    let backend = match mode {
        BackendOverride::Reference => Backend::Reference,
        BackendOverride::Auto => {
            if on_accelerator && accelerator_compiled() {
                Backend::Accelerator
            } else {
                Backend::Reference
            }
        }
        BackendOverride::Accelerator => {
            if !accelerator_compiled() {
                return Err(AttentionError::BackendUnavailable {
                    reason: "crate built without the flash-attn feature",
                });
            }
            if !on_accelerator {
                return Err(AttentionError::BackendUnavailable {
                    reason: "tensors reside in host memory",
                });
            }
            Backend::Accelerator
        }
    };
    debug!(?mode, on_accelerator, ?backend, "resolved attention backend");
    Ok(backend)
}
