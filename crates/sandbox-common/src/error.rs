//! Unified error types for the sandbox workspace.
//!
//! Every fallible operation in the workspace reports one of these variants;
//! higher layers add context by wrapping rather than redefining.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A system call failed.
    #[error("{operation} failed{}: {source}", path_suffix(.path))]
    Syscall {
        /// Name of the failed kernel operation (e.g. `mount`, `pivot_root`).
        operation: &'static str,
        /// Path the operation targeted, when there is one.
        path: Option<PathBuf>,
        /// The errno reported by the kernel.
        source: nix::errno::Errno,
    },

    /// A configuration document is malformed or a value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A module failed during one of its lifecycle phases.
    #[error("module {module}: {message}")]
    Module {
        /// Name of the failing module.
        module: &'static str,
        /// What went wrong.
        message: String,
    },

    /// Seccomp filter construction or installation failed.
    #[error("seccomp: {message}")]
    Seccomp {
        /// Description of the filter failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map_or_else(String::new, |p| format!(" at {}", p.display()))
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SandboxError>;
