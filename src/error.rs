//! Crate-wide error type.
//!
//! Every variant is fatal: the renderer has no fallback device path and no
//! partial-scene mode, so `main` logs the error and exits non-zero.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A Vulkan call returned a non-success status.
    #[error("vulkan: {what}: {result:?}")]
    Vk {
        what: &'static str,
        result: vk::Result,
    },

    /// A file could not be read.
    #[error("io: {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The scene manifest failed to parse.
    #[error("scene manifest {path:?}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A scene asset violates an input invariant (wrong index width,
    /// non-triangle topology, missing attribute, unsupported texel format).
    #[error("asset: {0}")]
    Asset(String),

    /// A linear arena was sized too small for the scene. The capacities are
    /// fixed at startup; this is a configuration error, not a transient one.
    #[error(
        "arena '{name}' exhausted: need {size} bytes at alignment {alignment}, \
         {remaining} of {capacity} remain"
    )]
    ArenaExhausted {
        name: &'static str,
        size: u64,
        alignment: u64,
        remaining: u64,
        capacity: u64,
    },

    /// The computed upload layout exceeds the staging buffer capacity.
    /// Raised before any byte is copied.
    #[error("staging overflow: upload needs {needed} bytes, capacity is {capacity}")]
    StagingOverflow { needed: u64, capacity: u64 },

    /// A fence or queue wait exceeded its deadline.
    #[error("deadline exceeded waiting for {0}")]
    Timeout(&'static str),

    /// Device or window bring-up failed before a device handle existed.
    #[error("init: {0}")]
    Init(String),
}

impl Error {
    pub fn vk(what: &'static str, result: vk::Result) -> Self {
        Error::Vk { what, result }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
