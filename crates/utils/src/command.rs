use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

use crate::ShellQuoted;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr. On failure the
    /// captured stderr is included in the error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and return its exit status, even if
    /// it was non-zero. Failing to spawn is still an error.
    fn run_status(&mut self) -> Result<ExitStatus>;

    /// The program and arguments, quoted so that it could be pasted into a shell.
    fn to_string_pretty(&self) -> String;
}

/// Helpers for [`ExitStatus`].
trait ExitStatusExt {
    /// Convert a non-successful exit status into an error, attaching stderr if any.
    fn check_status(&self, stderr: &[u8]) -> Result<()>;
}

/// Only show the tail of very verbose commands.
const MAX_STDERR_BYTES: usize = 1024;

fn last_utf8_content(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

impl ExitStatusExt for ExitStatus {
    fn check_status(&self, stderr: &[u8]) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        let stderr = last_utf8_content(stderr);
        if stderr.is_empty() {
            anyhow::bail!("Subprocess failed: {self:?}")
        } else {
            anyhow::bail!("Subprocess failed: {self:?}\n{stderr}")
        }
    }
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let mut child = self.stderr(Stdio::piped()).spawn()?;
        let mut stderr = Vec::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_end(&mut stderr)?;
        }
        let st = child.wait()?;
        st.check_status(&stderr)
    }

    fn run_status(&mut self) -> Result<ExitStatus> {
        self.status()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|a| ShellQuoted::new(a).to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_capture_stderr_success() -> Result<()> {
        Command::new("true").run_capture_stderr()?;
        assert!(Command::new("false").run_capture_stderr().is_err());
        Ok(())
    }

    #[test]
    fn test_run_capture_stderr() {
        let e = Command::new("/bin/sh")
            .args(["-c", "echo expected-this-oops-message 1>&2; exit 1"])
            .run_capture_stderr()
            .err()
            .unwrap();
        similar_asserts::assert_eq!(
            format!("{e:#}"),
            "Subprocess failed: ExitStatus(unix_wait_status(256))\nexpected-this-oops-message"
        );
    }

    #[test]
    fn test_run_status() -> Result<()> {
        let st = Command::new("/bin/sh").args(["-c", "exit 3"]).run_status()?;
        assert_eq!(st.code(), Some(3));
        assert!(Command::new("/this/does/not/exist").run_status().is_err());
        Ok(())
    }

    #[test]
    fn test_to_string_pretty() {
        let mut cmd = Command::new("dracut");
        cmd.args(["--kernel-cmdline", "root=UUID=x rw", "--kver", "6.9.1"]);
        similar_asserts::assert_eq!(
            cmd.to_string_pretty(),
            "dracut --kernel-cmdline 'root=UUID=x rw' --kver 6.9.1"
        );
    }
}
