//! # The kernel-install plugin
//!
//! kernel-install(8) runs every plugin in `/etc/kernel/install.d` and
//! `/usr/lib/kernel/install.d` as
//!
//! ```text
//! <plugin> add KERNEL-VERSION ENTRY-DIR KERNEL-IMAGE [INITRD...]
//! <plugin> remove KERNEL-VERSION ENTRY-DIR
//! ```
//!
//! On `add` this builds either a unified kernel image in `EFI/Linux`, or
//! a Type #1 loader entry with a separate kernel and initrd, depending on
//! the [`Layout`]. On `remove` it deletes whatever `add` may have produced.
//! Every invocation is independent; the artifact path is a pure function of
//! the kernel version, machine ID, boot root and boot counting setting.

use std::str::FromStr;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::bls_config::{parse_bls_config, BLSConfig};
use crate::builder::{BuildRequest, ImageBuilder};
use crate::entry::{self, ArtifactPattern, Layout, LoaderEntryPath};
use crate::errors::HookError;
use crate::package::PackageRegistry;
use crate::sysconf::{self, MachineId};

/// File name of the kernel in a Type #1 entry directory
const ENTRY_KERNEL: &str = "linux";
/// File name of the initrd in a Type #1 entry directory
const ENTRY_INITRD: &str = "initrd";
/// The kernel is copied here until the entry is complete
const STAGED_KERNEL: &str = ".linux.tmp";

/// The action requested by kernel-install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallCommand {
    Add,
    Remove,
}

impl FromStr for InstallCommand {
    type Err = HookError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            o => Err(HookError::InvalidCommand(o.to_owned())),
        }
    }
}

/// One invocation of the plugin, gathered from arguments and environment
/// once at the process boundary.
#[derive(Debug)]
pub(crate) struct HookInvocation {
    pub(crate) command: InstallCommand,
    pub(crate) kernel_version: String,
    pub(crate) entry_dir: Utf8PathBuf,
    pub(crate) kernel_image: Option<Utf8PathBuf>,
    /// Extra initrds passed by kernel-install; accepted but unused, since
    /// the builder generates the complete initrd itself.
    pub(crate) initrds: Vec<Utf8PathBuf>,
    /// From `KERNEL_INSTALL_MACHINE_ID`, otherwise read from the host
    pub(crate) machine_id: Option<MachineId>,
    /// From `KERNEL_INSTALL_BOOT_ROOT`, otherwise derived from `entry_dir`
    pub(crate) boot_root: Option<Utf8PathBuf>,
    pub(crate) layout: Layout,
}

/// The hook, with its collaborators.
pub(crate) struct Hook<'a> {
    /// The host root, `/` outside of tests
    pub(crate) root: &'a Dir,
    pub(crate) builder: &'a dyn ImageBuilder,
    /// Only set if package deregistration is enabled
    pub(crate) registry: Option<&'a dyn PackageRegistry>,
}

impl std::fmt::Debug for Hook<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("deregister", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

/// Where the artifacts for one kernel go.
#[derive(Debug)]
struct Target {
    machine_id: MachineId,
    boot_root: Utf8PathBuf,
    boot: Dir,
}

impl Hook<'_> {
    /// Run the requested command.
    pub(crate) fn run(&self, inv: &HookInvocation) -> Result<()> {
        entry::validate_kernel_version(&inv.kernel_version)?;
        match inv.command {
            InstallCommand::Add => self.add(inv),
            InstallCommand::Remove => self.remove(inv),
        }
    }

    fn target(&self, inv: &HookInvocation) -> Result<Target> {
        let machine_id = match inv.machine_id.as_ref() {
            Some(m) => m.clone(),
            None => sysconf::read_machine_id(self.root)?,
        };
        let boot_root = match inv.boot_root.as_ref() {
            Some(b) => b.clone(),
            None => entry::derive_boot_root(&inv.entry_dir, &machine_id, &inv.kernel_version)?,
        };
        let boot = Dir::open_ambient_dir(&boot_root, cap_std::ambient_authority())
            .with_context(|| format!("Opening boot root {boot_root}"))?;
        Ok(Target {
            machine_id,
            boot_root,
            boot,
        })
    }

    #[context("Adding kernel {}", inv.kernel_version)]
    fn add(&self, inv: &HookInvocation) -> Result<()> {
        let kver = inv.kernel_version.as_str();
        let kernel_image = inv
            .kernel_image
            .as_deref()
            .ok_or(HookError::MissingKernelImage)?;
        let target = self.target(inv)?;
        let os_name = sysconf::resolve_os_name(self.root, kver)?;
        let (_, cmdline) = sysconf::resolve_boot_options(self.root)?;
        let tries = sysconf::read_tries(self.root)?;
        let entry = LoaderEntryPath::compute(
            inv.layout,
            &target.boot_root,
            kver,
            &target.machine_id,
            tries,
        );
        let parent = entry.parent();
        target
            .boot
            .create_dir_all(entry.parent_relative())
            .with_context(|| format!("Creating directory {parent}"))?;
        for initrd in &inv.initrds {
            tracing::debug!("Ignoring initrd {initrd}");
        }
        if cmdline.is_empty() {
            tracing::warn!("Installing {entry} with an empty kernel command line");
        }
        let no_image_if_not_needed = cmdline.root_is_partuuid();
        tracing::debug!("Installing {os_name} to {entry}");

        match inv.layout {
            Layout::Uki => {
                let output = entry.absolute();
                let built = self.builder.build(&BuildRequest {
                    kernel_version: kver,
                    kernel_image,
                    cmdline: &cmdline,
                    output: &output,
                    uefi: true,
                    no_image_if_not_needed,
                })?;
                if !built {
                    tracing::warn!("No image generated for {kver}, leaving {entry} as it was");
                    return Ok(());
                }
            }
            Layout::Bls => {
                let staged =
                    StagedEntryDir::new(&target.boot, &target.boot_root, &target.machine_id, kver)?;
                staged.install_kernel(kernel_image)?;
                let built = self.builder.build(&BuildRequest {
                    kernel_version: kver,
                    kernel_image,
                    cmdline: &cmdline,
                    output: &target.boot_root.join(&staged.subdir).join(ENTRY_INITRD),
                    uefi: false,
                    no_image_if_not_needed,
                })?;
                if !built {
                    // Don't leave an initrd from an earlier build next to the new kernel
                    staged.remove_initrd()?;
                }
                staged.commit()?;
                let config = loader_entry(
                    &target.boot,
                    &entry,
                    &os_name,
                    kver,
                    &target.machine_id,
                    &cmdline.join(),
                    built,
                )?;
                let entries = target.boot.open_dir(entry.parent_relative())?;
                entries
                    .atomic_write(entry.file_name(), config.to_string())
                    .with_context(|| format!("Writing {entry}"))?;
            }
        }
        tracing::info!("Installed {entry}");
        Ok(())
    }

    #[context("Removing kernel {}", inv.kernel_version)]
    fn remove(&self, inv: &HookInvocation) -> Result<()> {
        let kver = inv.kernel_version.as_str();
        let target = self.target(inv)?;
        let pattern = ArtifactPattern::new(inv.layout, kver, &target.machine_id)?;
        for name in pattern.remove_matching(&target.boot)? {
            tracing::info!("Removed {}/{name}", inv.layout.entries_dir());
        }
        if inv.layout == Layout::Bls {
            let entry_subdir = format!("{}/{kver}", target.machine_id);
            if let Some(d) = target.boot.open_dir_optional(&entry_subdir)? {
                for name in [ENTRY_KERNEL, ENTRY_INITRD] {
                    d.remove_file_optional(name)
                        .with_context(|| format!("Removing {entry_subdir}/{name}"))?;
                }
                match target.boot.remove_dir(&entry_subdir) {
                    Ok(()) => {}
                    // Other plugins may have left content behind; not ours to delete
                    Err(e) => tracing::debug!("Keeping {entry_subdir}: {e}"),
                }
            }
        }
        if let Some(registry) = self.registry {
            if let Err(e) = registry.deregister(kver) {
                tracing::warn!("{e:#}");
            }
        }
        Ok(())
    }
}

/// A Type #1 entry directory being populated. The kernel is copied to
/// a temporary name first; unless [`StagedEntryDir::commit`] moved it into
/// place, it is removed on drop along with any directories created here.
#[derive(Debug)]
struct StagedEntryDir<'d> {
    boot: &'d Dir,
    /// `<machine id>/<kver>`, relative to the boot root
    subdir: String,
    /// Directories we created, outermost first
    created: Vec<String>,
    done: bool,
}

impl<'d> StagedEntryDir<'d> {
    fn new(
        boot: &'d Dir,
        boot_root: &Utf8Path,
        machine_id: &MachineId,
        kver: &str,
    ) -> Result<Self> {
        let parent = machine_id.to_string();
        let mut staged = Self {
            boot,
            subdir: format!("{parent}/{kver}"),
            created: Vec::new(),
            done: false,
        };
        for p in [parent, staged.subdir.clone()] {
            if boot.try_exists(&p)? {
                continue;
            }
            boot.create_dir(&p)
                .with_context(|| format!("Creating directory {boot_root}/{p}"))?;
            staged.created.push(p);
        }
        // Left over from an interrupted run
        staged.dir()?.remove_file_optional(STAGED_KERNEL)?;
        Ok(staged)
    }

    fn dir(&self) -> Result<Dir> {
        self.boot
            .open_dir(&self.subdir)
            .with_context(|| format!("Opening {}", self.subdir))
    }

    #[context("Installing kernel image {src}")]
    fn install_kernel(&self, src: &Utf8Path) -> Result<()> {
        let mut f = std::fs::File::open(src)?;
        self.dir()?
            .atomic_replace_with(STAGED_KERNEL, |w| std::io::copy(&mut f, w).map(|_| ()))?;
        Ok(())
    }

    fn remove_initrd(&self) -> Result<()> {
        if self.dir()?.remove_file_optional(ENTRY_INITRD)? {
            tracing::debug!("Removed stale {}/{ENTRY_INITRD}", self.subdir);
        }
        Ok(())
    }

    /// Move the kernel into place.
    fn commit(mut self) -> Result<()> {
        let d = self.dir()?;
        d.rename(STAGED_KERNEL, &d, ENTRY_KERNEL)
            .with_context(|| format!("Renaming {STAGED_KERNEL} to {ENTRY_KERNEL}"))?;
        self.done = true;
        Ok(())
    }
}

impl Drop for StagedEntryDir<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(d) = self.dir() {
            if let Err(e) = d.remove_file_optional(STAGED_KERNEL) {
                tracing::warn!("Failed to clean up {}/{STAGED_KERNEL}: {e}", self.subdir);
            }
        }
        for p in self.created.iter().rev() {
            if let Err(e) = self.boot.remove_dir(p) {
                tracing::debug!("Keeping {p}: {e}");
            }
        }
    }
}

/// Render the Type #1 entry. An existing entry at the same path (for
/// example from systemd's own loader entry plugin) is updated in place,
/// keeping its other keys but pointing at our single initrd, or at none
/// if the builder didn't generate one.
fn loader_entry(
    boot: &Dir,
    entry: &LoaderEntryPath,
    os_name: &str,
    kver: &str,
    machine_id: &MachineId,
    options: &str,
    has_initrd: bool,
) -> Result<BLSConfig> {
    let linux = format!("/{machine_id}/{kver}/{ENTRY_KERNEL}");
    let initrd = format!("/{machine_id}/{kver}/{ENTRY_INITRD}");
    let existing_path = format!("{}/{}", entry.parent_relative(), entry.file_name());
    let existing = match boot.open_optional(&existing_path)? {
        Some(mut f) => {
            let mut buf = String::new();
            std::io::Read::read_to_string(&mut f, &mut buf)?;
            match parse_bls_config(&buf) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!("Replacing unparseable {entry}: {e}");
                    None
                }
            }
        }
        None => None,
    };
    let mut config = existing.unwrap_or_else(|| BLSConfig {
        title: Some(os_name.to_owned()),
        version: kver.to_owned(),
        machine_id: Some(machine_id.to_string()),
        ..Default::default()
    });
    config.linux = linux;
    config.options = Some(options.to_owned());
    if has_initrd {
        config.replace_initrds(initrd);
    } else {
        for p in config.initrd.drain(..) {
            tracing::debug!("Dropping initrd line: {p}");
        }
    }
    Ok(config)
}
