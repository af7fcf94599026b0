use core::fmt;

use slipstream_mem::MemError;

/// Errors surfaced by configuration publication. A failed publication
/// never mutates the live generation: partially built structures are
/// freed before the error propagates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    OutOfMemory,
    /// A pipeline referenced a module type unknown to the dataplane.
    UnknownModuleType(String),
    /// A pipeline referenced a module instance absent from the registry.
    UnknownModule(String),
    /// A device referenced a pipeline index beyond the registry.
    UnknownPipeline(u64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "configuration memory exhausted"),
            Self::UnknownModuleType(name) => write!(f, "unknown module type {name:?}"),
            Self::UnknownModule(name) => write!(f, "unknown module instance {name:?}"),
            Self::UnknownPipeline(idx) => write!(f, "pipeline index {idx} out of range"),
        }
    }
}

impl core::error::Error for ConfigError {}

impl From<MemError> for ConfigError {
    fn from(_: MemError) -> Self {
        Self::OutOfMemory
    }
}

pub type ConfigResult<T = ()> = Result<T, ConfigError>;
