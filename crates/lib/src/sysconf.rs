//! Readers for the host configuration files the hook depends on.
//!
//! Every path here is relative to a host root directory, which is `/`
//! in production.

use std::fmt::Display;
use std::io::Read;
use std::str::FromStr;

use anyhow::{Context, Result};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::Serialize;

use crate::errors::HookError;
use crate::kernel_cmdline::BootOptions;

/// Boot counting: number of tries to give a freshly installed entry.
pub(crate) const KERNEL_TRIES: &str = "etc/kernel/tries";
/// The persistent machine identifier.
const MACHINE_ID: &str = "etc/machine-id";
/// os-release candidates, most specific first.
const OS_RELEASE: &[&str] = &["etc/os-release", "usr/lib/os-release"];

/// Read a file relative to `root`, returning `None` if it doesn't exist.
fn read_optional(root: &Dir, path: &str) -> Result<Option<String>> {
    let Some(mut f) = root
        .open_optional(path)
        .with_context(|| format!("Opening /{path}"))?
    else {
        return Ok(None);
    };
    let mut buf = String::new();
    f.read_to_string(&mut buf)
        .with_context(|| format!("Reading /{path}"))?;
    Ok(Some(buf))
}

/// Where the kernel command line for new entries comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum BootOptionsSource {
    /// Local administrator override
    EtcKernelCmdline,
    /// Vendor default
    UsrLibKernelCmdline,
    /// Whatever the running kernel was booted with
    ProcCmdline,
}

impl BootOptionsSource {
    /// Candidates, in priority order.
    const ALL: [Self; 3] = [
        Self::EtcKernelCmdline,
        Self::UsrLibKernelCmdline,
        Self::ProcCmdline,
    ];

    fn path(&self) -> &'static str {
        match self {
            Self::EtcKernelCmdline => "etc/kernel/cmdline",
            Self::UsrLibKernelCmdline => "usr/lib/kernel/cmdline",
            Self::ProcCmdline => "proc/cmdline",
        }
    }

    fn interpret(&self, text: &str) -> BootOptions {
        match self {
            Self::EtcKernelCmdline | Self::UsrLibKernelCmdline => BootOptions::parse(text),
            Self::ProcCmdline => BootOptions::from_running(text),
        }
    }
}

impl Display for BootOptionsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.path())
    }
}

/// Resolve the kernel command line for a new entry: the first candidate
/// file that exists wins, even if it is empty. If there is no candidate
/// at all the result is empty.
#[context("Resolving kernel command line")]
pub(crate) fn resolve_boot_options(root: &Dir) -> Result<(Option<BootOptionsSource>, BootOptions)> {
    for source in BootOptionsSource::ALL {
        if let Some(text) = read_optional(root, source.path())? {
            let opts = source.interpret(&text);
            tracing::debug!("Using kernel command line from {source}: {opts}");
            return Ok((Some(source), opts));
        }
    }
    tracing::warn!("No kernel command line source found, using an empty command line");
    Ok((None, BootOptions::default()))
}

/// Parse an os-release file into its human readable name.
fn os_name_from_release(text: &str) -> Option<String> {
    let mut pretty_name = None;
    let mut name = None;
    let mut version_id = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        // Values use shell quoting
        let v = match shlex::split(v).as_deref() {
            Some([v]) => v.to_owned(),
            Some([]) => String::new(),
            _ => v.to_owned(),
        };
        match k {
            "PRETTY_NAME" => pretty_name = Some(v),
            "NAME" => name = Some(v),
            "VERSION_ID" => version_id = Some(v),
            _ => {}
        }
    }
    pretty_name.filter(|v| !v.is_empty()).or_else(|| {
        let name = name.filter(|v| !v.is_empty())?;
        Some(match version_id.filter(|v| !v.is_empty()) {
            Some(version_id) => format!("{name} {version_id}"),
            None => name,
        })
    })
}

/// Find a human readable name for the installed OS, falling back to
/// `Linux <kver>`.
#[context("Resolving OS name")]
pub(crate) fn resolve_os_name(root: &Dir, kver: &str) -> Result<String> {
    for path in OS_RELEASE {
        if let Some(name) = read_optional(root, path)?
            .as_deref()
            .and_then(os_name_from_release)
        {
            return Ok(name);
        }
    }
    Ok(format!("Linux {kver}"))
}

/// Read the boot counting tries; `None` if not configured.
///
/// The content must be plain decimal digits. Like systemd-boot, which
/// stores the counter as an unsigned 32 bit value, anything above
/// `u32::MAX` is rejected.
pub(crate) fn read_tries(root: &Dir) -> Result<Option<u32>> {
    let Some(content) = read_optional(root, KERNEL_TRIES)? else {
        return Ok(None);
    };
    let content = content.trim();
    let invalid = || HookError::InvalidTries {
        path: format!("/{KERNEL_TRIES}"),
        content: content.to_owned(),
    };
    // u32::from_str also takes a leading '+'
    if content.is_empty() || !content.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid().into());
    }
    let tries = content.parse::<u32>().map_err(|_| invalid())?;
    Ok(Some(tries))
}

/// A machine identifier as found in `/etc/machine-id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub(crate) struct MachineId(String);

impl FromStr for MachineId {
    type Err = HookError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || HookError::InvalidMachineId(s.to_owned());
        // hex accepts uppercase too, which machine-id(5) doesn't
        if s.len() != 32 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(invalid());
        }
        hex::decode(s).map_err(|_| invalid())?;
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for MachineId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read and validate `/etc/machine-id`.
#[context("Reading machine ID")]
pub(crate) fn read_machine_id(root: &Dir) -> Result<MachineId> {
    let content = read_optional(root, MACHINE_ID)?
        .ok_or_else(|| anyhow::anyhow!("/{MACHINE_ID} not found"))?;
    Ok(content.trim().parse()?)
}
