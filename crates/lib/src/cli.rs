//! # sdboot command line interface
//!
//! The main entry point is `sdboot kernel-install`, which is also reached
//! when the binary is invoked through a symlink whose name ends in
//! `.install`, as kernel-install(8) does for its plugins.

use std::ffi::{OsStr, OsString};
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use clap::Parser;
use serde::Serialize;

use crate::builder::Dracut;
use crate::config::{self, Settings};
use crate::entry::{Layout, LoaderEntryPath};
use crate::hook::{Hook, HookInvocation};
use crate::kernel_cmdline::BootOptions;
use crate::package::{CommandRegistry, PackageRegistry};
use crate::sysconf::{self, BootOptionsSource, MachineId};

/// Set by kernel-install to the machine ID in use
const MACHINE_ID_ENV: &str = "KERNEL_INSTALL_MACHINE_ID";
/// Set by kernel-install to the mount point of the boot partition
const BOOT_ROOT_ENV: &str = "KERNEL_INSTALL_BOOT_ROOT";
/// Plugins installed in kernel-install's directories carry this suffix
const PLUGIN_SUFFIX: &str = ".install";
/// Where the ESP is usually mounted on Fedora
const DEFAULT_BOOT_ROOT: &str = "/boot/efi";

/// Arguments passed by kernel-install to its plugins.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct KernelInstallOpts {
    /// Either `add` or `remove`
    pub(crate) command: String,

    /// The kernel release, as in `uname -r`
    pub(crate) kernel_version: String,

    /// The per-kernel entry directory below the boot root
    pub(crate) entry_dir: Utf8PathBuf,

    /// The kernel image; required for `add`
    pub(crate) kernel_image: Option<Utf8PathBuf>,

    /// Additional initrds; accepted but not used
    pub(crate) initrds: Vec<Utf8PathBuf>,

    /// Override the installation layout
    #[clap(long, value_enum)]
    pub(crate) layout: Option<Layout>,

    /// Use this settings file instead of the default locations
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,
}

/// Print where the artifact for a kernel would be installed.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct EntryPathOpts {
    /// The kernel release
    pub(crate) kernel_version: String,

    /// Defaults to `$KERNEL_INSTALL_MACHINE_ID`, then `/etc/machine-id`
    #[clap(long)]
    pub(crate) machine_id: Option<String>,

    /// Defaults to `$KERNEL_INSTALL_BOOT_ROOT`, then `/boot/efi`
    #[clap(long)]
    pub(crate) boot_root: Option<Utf8PathBuf>,

    #[clap(long, value_enum)]
    pub(crate) layout: Option<Layout>,

    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,
}

/// Print the kernel command line new entries would get.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct BootOptionsOpts {
    /// Output in JSON format
    #[clap(long)]
    pub(crate) json: bool,
}

/// Install unified kernel images and loader entries for systemd-boot.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "sdboot")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// Run as a kernel-install plugin.
    ///
    /// This is normally invoked by kernel-install(8) through a symlink
    /// in `/etc/kernel/install.d`.
    KernelInstall(KernelInstallOpts),
    /// Print the computed loader entry path for a kernel.
    EntryPath(EntryPathOpts),
    /// Print the resolved kernel command line and where it came from.
    BootOptions(BootOptionsOpts),
}

/// Read an environment variable, treating empty as unset.
fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn open_root() -> Result<Dir> {
    Dir::open_ambient_dir("/", cap_std::ambient_authority()).context("Opening /")
}

fn load_settings(root: &Dir, path: Option<&Utf8Path>) -> Result<Settings> {
    match path {
        Some(p) => Settings::load_from(p),
        None => Settings::load(root),
    }
}

impl KernelInstallOpts {
    /// Combine the arguments with the environment exported by kernel-install.
    fn into_invocation(
        self,
        env: impl Fn(&str) -> Option<String>,
        settings: &Settings,
    ) -> Result<HookInvocation> {
        let lookup = |k: &str| env(k).filter(|v| !v.is_empty());
        let command = self.command.parse()?;
        let machine_id = lookup(MACHINE_ID_ENV)
            .map(|v| v.parse::<MachineId>())
            .transpose()
            .with_context(|| format!("Parsing ${MACHINE_ID_ENV}"))?;
        let boot_root = lookup(BOOT_ROOT_ENV).map(Utf8PathBuf::from);
        let layout =
            config::resolve_layout(self.layout, lookup(config::LAYOUT_ENV).as_deref(), settings);
        Ok(HookInvocation {
            command,
            kernel_version: self.kernel_version,
            entry_dir: self.entry_dir,
            kernel_image: self.kernel_image.filter(|p| !p.as_str().is_empty()),
            initrds: self.initrds,
            machine_id,
            boot_root,
            layout,
        })
    }
}

fn kernel_install(opts: KernelInstallOpts) -> Result<()> {
    let root = &open_root()?;
    let settings = load_settings(root, opts.config.as_deref())?;
    let invocation = opts.into_invocation(env_nonempty, &settings)?;
    tracing::debug!("{invocation:?}");
    let builder = Dracut::new(&settings);
    let registry = settings
        .package
        .deregister
        .as_deref()
        .and_then(CommandRegistry::new);
    let hook = Hook {
        root,
        builder: &builder,
        registry: registry.as_ref().map(|r| r as &dyn PackageRegistry),
    };
    hook.run(&invocation)
}

fn entry_path(opts: EntryPathOpts) -> Result<()> {
    let root = &open_root()?;
    let settings = load_settings(root, opts.config.as_deref())?;
    crate::entry::validate_kernel_version(&opts.kernel_version)?;
    let machine_id = match opts.machine_id.or_else(|| env_nonempty(MACHINE_ID_ENV)) {
        Some(m) => m.parse::<MachineId>()?,
        None => sysconf::read_machine_id(root)?,
    };
    let boot_root = opts
        .boot_root
        .or_else(|| env_nonempty(BOOT_ROOT_ENV).map(Utf8PathBuf::from))
        .unwrap_or_else(|| DEFAULT_BOOT_ROOT.into());
    let layout = config::resolve_layout(
        opts.layout,
        env_nonempty(config::LAYOUT_ENV).as_deref(),
        &settings,
    );
    let tries = sysconf::read_tries(root)?;
    let path =
        LoaderEntryPath::compute(layout, &boot_root, &opts.kernel_version, &machine_id, tries);
    println!("{path}");
    Ok(())
}

/// The output of `boot-options --json`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BootOptionsReport {
    source: Option<BootOptionsSource>,
    options: BootOptions,
    /// The value of `root=`
    root: Option<String>,
    no_image_if_not_needed: bool,
}

impl BootOptionsReport {
    fn write_text(&self, mut out: impl Write) -> Result<()> {
        match self.source {
            Some(s) => writeln!(out, "Source: {s}")?,
            None => writeln!(out, "Source: none")?,
        }
        writeln!(out, "Options: {}", self.options)?;
        writeln!(out, "Root: {}", self.root.as_deref().unwrap_or("none"))?;
        writeln!(out, "NoImageIfNotNeeded: {}", self.no_image_if_not_needed)?;
        Ok(())
    }
}

fn boot_options(opts: BootOptionsOpts) -> Result<()> {
    let root = &open_root()?;
    let (source, options) = sysconf::resolve_boot_options(root)?;
    let report = BootOptionsReport {
        source,
        root: options.root(),
        no_image_if_not_needed: options.root_is_partuuid(),
        options,
    };
    let mut out = std::io::stdout().lock();
    if opts.json {
        serde_json::to_writer_pretty(&mut out, &report)?;
        writeln!(out)?;
    } else {
        report.write_text(&mut out)?;
    }
    out.flush()?;
    Ok(())
}

/// The file name we were invoked under.
fn callname_from_argv0(argv0: &OsStr) -> &str {
    let default = "sdboot";
    std::path::Path::new(argv0)
        .file_name()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
}

impl Opt {
    /// Parse, mapping a `*.install` argv0 to the `kernel-install` verb.
    fn parse_including_static<I>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator,
        I::Item: Into<OsString> + Clone,
    {
        let mut args = args.into_iter().map(Into::<OsString>::into);
        let first = if let Some(first) = args.next() {
            let argv0 = callname_from_argv0(&first);
            tracing::debug!("argv0={argv0:?}");
            if argv0.ends_with(PLUGIN_SUFFIX) {
                let base_args = ["sdboot", "kernel-install"].map(OsString::from);
                return Opt::try_parse_from(base_args.into_iter().chain(args));
            }
            Some(first)
        } else {
            None
        };
        Opt::try_parse_from(first.into_iter().chain(args))
    }
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure to parse; usage errors exit
/// with status 1 like every other failure of the hook.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = match Opt::parse_including_static(args) {
        Ok(opt) => opt,
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };
    match opt {
        Opt::KernelInstall(opts) => kernel_install(opts),
        Opt::EntryPath(opts) => entry_path(opts),
        Opt::BootOptions(opts) => boot_options(opts),
    }
}
