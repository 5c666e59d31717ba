//! Failures that the kernel-install dispatcher should see described precisely.
//!
//! Everything else is plain [`anyhow::Error`] with context attached.

use std::process::ExitStatus;

/// A usage or validation failure of the hook.
#[derive(thiserror::Error, Debug)]
pub(crate) enum HookError {
    #[error("Unknown command '{0}', expected 'add' or 'remove'")]
    InvalidCommand(String),
    #[error("Missing kernel image argument, required for 'add'")]
    MissingKernelImage,
    #[error("Invalid machine ID '{0}': expected 32 lowercase hexadecimal characters")]
    InvalidMachineId(String),
    #[error("Invalid kernel version '{0}'")]
    InvalidKernelVersion(String),
    #[error("Invalid content in {path}: expected a decimal number from 0 to 4294967295, found '{content}'")]
    InvalidTries { path: String, content: String },
    #[error("{program} failed: {status}")]
    BuilderFailed { program: String, status: ExitStatus },
}
