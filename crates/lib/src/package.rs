//! Optional cleanup of the package database when a kernel is removed.

use std::process::Command;

use anyhow::Result;
use fn_error_context::context;
use sdboot_utils::CommandRunExt;

/// Placeholder replaced by the kernel version in configured arguments.
const KVER_PLACEHOLDER: &str = "{kver}";

/// Drops the package record for an installed kernel.
pub(crate) trait PackageRegistry {
    fn deregister(&self, kver: &str) -> Result<()>;
}

/// Runs an administrator-configured command.
#[derive(Debug)]
pub(crate) struct CommandRegistry {
    argv: Vec<String>,
}

impl CommandRegistry {
    /// `None` if the command line is empty, i.e. deregistration is disabled.
    pub(crate) fn new(argv: &[String]) -> Option<Self> {
        if argv.is_empty() {
            return None;
        }
        Some(Self {
            argv: argv.to_vec(),
        })
    }

    fn command(&self, kver: &str) -> Command {
        let mut args = self.argv.iter().map(|a| a.replace(KVER_PLACEHOLDER, kver));
        // Non-empty by construction
        let mut cmd = Command::new(args.next().unwrap_or_default());
        cmd.args(args);
        cmd
    }
}

impl PackageRegistry for CommandRegistry {
    #[context("Deregistering package for {kver}")]
    fn deregister(&self, kver: &str) -> Result<()> {
        self.command(kver).log_debug().run_capture_stderr()
    }
}
