//! Backend override configuration for the attention kernels.
//!
//! Each attention phase (prefill, decode) can independently be pinned to the
//! reference or accelerator kernel, or left in `auto` mode where the choice
//! follows tensor residency. Overrides are per `Attention` instance rather
//! than process-wide, so tests can pin backends without global state.

use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Rejected backend override value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown attention backend {0:?}: expected \"auto\", \"reference\", or \"accelerator\"")]
pub struct ConfigError(pub String);

/// Kernel selection override for one attention phase.
///
/// The empty string parses as `Auto`, matching unset configuration keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum BackendOverride {
    /// Follow tensor residency: accelerator kernel on device, reference on host.
    #[default]
    Auto,
    /// Always the portable reference kernel.
    Reference,
    /// Require the accelerator kernel; an error if tensors are on the host.
    Accelerator,
}

impl FromStr for BackendOverride {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "auto" => Ok(Self::Auto),
            "reference" => Ok(Self::Reference),
            "accelerator" => Ok(Self::Accelerator),
            other => Err(ConfigError(other.to_string())),
        }
    }
}

impl TryFrom<String> for BackendOverride {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Per-phase backend overrides, threaded into `Attention` at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct AttentionBackendConfig {
    #[serde(default)]
    pub prefill_backend: BackendOverride,
    #[serde(default)]
    pub decode_backend: BackendOverride,
}

impl AttentionBackendConfig {
    /// Parse both overrides from their string forms, rejecting unknown values.
    pub fn from_strs(prefill: &str, decode: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            prefill_backend: prefill.parse()?,
            decode_backend: decode.parse()?,
        })
    }
}
