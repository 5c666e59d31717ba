//! Where boot artifacts live on the boot partition.
//!
//! See <https://uapi-group.org/specifications/specs/boot_loader_specification/>
//! for the two layouts: Type #1 text entries in `loader/entries`, and
//! Type #2 unified kernel images in `EFI/Linux`.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use clap::ValueEnum;
use fn_error_context::context;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::HookError;
use crate::sysconf::MachineId;

/// The EFI Linux directory, scanned by systemd-boot for Type #2 entries
pub(crate) const EFI_LINUX: &str = "EFI/Linux";
/// The Type #1 entries directory
pub(crate) const LOADER_ENTRIES: &str = "loader/entries";

/// How kernels are installed on the boot partition.
#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// A text loader entry plus separate kernel and initrd files
    Bls,
    /// A single unified kernel image
    #[default]
    Uki,
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Layout::Bls => "bls",
            Layout::Uki => "uki",
        };
        f.write_str(s)
    }
}

impl TryFrom<&str> for Layout {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "bls" => Ok(Self::Bls),
            "uki" => Ok(Self::Uki),
            unrecognized => Err(anyhow::anyhow!("Unrecognized layout: '{unrecognized}'")),
        }
    }
}

impl Layout {
    /// Directory holding the entries, relative to the boot root.
    pub(crate) fn entries_dir(&self) -> &'static str {
        match self {
            Layout::Bls => LOADER_ENTRIES,
            Layout::Uki => EFI_LINUX,
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Layout::Bls => "conf",
            Layout::Uki => "efi",
        }
    }

    /// The file name without boot counting suffix and extension.
    fn stem(&self, kver: &str, machine_id: &MachineId) -> String {
        match self {
            Layout::Bls => format!("{machine_id}-{kver}"),
            Layout::Uki => format!("{kver}-{machine_id}"),
        }
    }
}

/// Reject kernel versions that can't safely be used as a path component.
pub(crate) fn validate_kernel_version(kver: &str) -> Result<(), HookError> {
    let bad = kver.is_empty()
        || kver == "."
        || kver == ".."
        || kver.contains('/')
        || kver.chars().any(|c| c.is_whitespace() || c.is_control());
    if bad {
        return Err(HookError::InvalidKernelVersion(kver.to_owned()));
    }
    Ok(())
}

/// The computed location of the artifact for one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct LoaderEntryPath {
    boot_root: Utf8PathBuf,
    file_name: String,
    layout: Layout,
}

impl LoaderEntryPath {
    pub(crate) fn compute(
        layout: Layout,
        boot_root: &Utf8Path,
        kver: &str,
        machine_id: &MachineId,
        tries: Option<u32>,
    ) -> Self {
        let stem = layout.stem(kver, machine_id);
        let ext = layout.extension();
        let file_name = match tries {
            Some(t) => format!("{stem}+{t}.{ext}"),
            None => format!("{stem}.{ext}"),
        };
        Self {
            boot_root: boot_root.to_owned(),
            file_name,
            layout,
        }
    }

    pub(crate) fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Parent directory, relative to the boot root.
    pub(crate) fn parent_relative(&self) -> &'static str {
        self.layout.entries_dir()
    }

    pub(crate) fn parent(&self) -> Utf8PathBuf {
        self.boot_root.join(self.parent_relative())
    }

    pub(crate) fn absolute(&self) -> Utf8PathBuf {
        self.parent().join(&self.file_name)
    }
}

impl std::fmt::Display for LoaderEntryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.absolute())
    }
}

/// Split `<boot root>/<machine id>/<kver>` into the boot root.
pub(crate) fn split_entry_dir<'p>(
    entry_dir: &'p Utf8Path,
    machine_id: &MachineId,
    kver: &str,
) -> Result<&'p Utf8Path> {
    anyhow::ensure!(
        entry_dir.is_absolute(),
        "Entry directory {entry_dir} is not absolute"
    );
    let Some(last) = entry_dir.file_name() else {
        anyhow::bail!("Entry directory {entry_dir} has no final component");
    };
    anyhow::ensure!(
        last == kver,
        "Entry directory {entry_dir} does not end in kernel version {kver}"
    );
    let token_dir = entry_dir
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Entry directory {entry_dir} is too short"))?;
    anyhow::ensure!(
        token_dir.file_name() == Some(machine_id.as_ref()),
        "Entry directory {entry_dir} is not below machine ID {machine_id}"
    );
    token_dir
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Entry directory {entry_dir} is too short"))
}

/// Derive the boot root from the entry directory passed by kernel-install,
/// and verify it's an existing directory.
#[context("Deriving boot root from {entry_dir}")]
pub(crate) fn derive_boot_root(
    entry_dir: &Utf8Path,
    machine_id: &MachineId,
    kver: &str,
) -> Result<Utf8PathBuf> {
    let boot_root = split_entry_dir(entry_dir, machine_id, kver)?;
    let d = Dir::open_ambient_dir(boot_root, cap_std::ambient_authority())
        .with_context(|| format!("Opening {boot_root}"))?;
    match d.is_mountpoint(".") {
        Ok(Some(true)) => {}
        Ok(_) => tracing::debug!("{boot_root} is not a mount point"),
        Err(e) => tracing::debug!("Failed to query mount state of {boot_root}: {e}"),
    }
    Ok(boot_root.to_owned())
}

/// Matches the file names this hook may have produced for one kernel,
/// with or without a boot counting suffix (`+LEFT` or `+LEFT-DONE`).
#[derive(Debug)]
pub(crate) struct ArtifactPattern {
    layout: Layout,
    re: Regex,
}

impl ArtifactPattern {
    pub(crate) fn new(layout: Layout, kver: &str, machine_id: &MachineId) -> Result<Self> {
        let stem = regex::escape(&layout.stem(kver, machine_id));
        let ext = layout.extension();
        let re = Regex::new(&format!(r"^{stem}(\+[0-9]+(-[0-9]+)?)?\.{ext}$"))
            .context("Compiling artifact pattern")?;
        Ok(Self { layout, re })
    }

    pub(crate) fn matches(&self, name: &str) -> bool {
        self.re.is_match(name)
    }

    /// Remove every matching file in the layout's entries directory.
    /// A missing directory is not an error. Returns the removed names.
    #[context("Removing old artifacts")]
    pub(crate) fn remove_matching(&self, boot: &Dir) -> Result<Vec<String>> {
        let dirname = self.layout.entries_dir();
        let Some(d) = boot
            .open_dir_optional(dirname)
            .with_context(|| format!("Opening {dirname}"))?
        else {
            return Ok(Vec::new());
        };
        let mut removed = Vec::new();
        for ent in d.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !self.matches(name) || !ent.file_type()?.is_file() {
                continue;
            }
            if d.remove_file_optional(name)
                .with_context(|| format!("Removing {dirname}/{name}"))?
            {
                tracing::debug!("Removed {dirname}/{name}");
                removed.push(name.to_owned());
            }
        }
        removed.sort();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MID: &str = "0123456789abcdef0123456789abcdef";
    const KVER: &str = "6.9.1-200.fc40.x86_64";

    fn mid() -> MachineId {
        MID.parse().unwrap()
    }

    #[test]
    fn test_uki_path() {
        let esp = Utf8Path::new("/boot/efi");
        let p = LoaderEntryPath::compute(Layout::Uki, esp, KVER, &mid(), None);
        assert_eq!(p.absolute(), format!("/boot/efi/EFI/Linux/{KVER}-{MID}.efi"));
        let p = LoaderEntryPath::compute(Layout::Uki, esp, KVER, &mid(), Some(2));
        assert_eq!(p.absolute(), format!("/boot/efi/EFI/Linux/{KVER}-{MID}+2.efi"));
        assert_eq!(p.parent(), "/boot/efi/EFI/Linux");
    }

    #[test]
    fn test_bls_path() {
        let boot = Utf8Path::new("/boot");
        let p = LoaderEntryPath::compute(Layout::Bls, boot, KVER, &mid(), None);
        assert_eq!(p.to_string(), format!("/boot/loader/entries/{MID}-{KVER}.conf"));
        let p = LoaderEntryPath::compute(Layout::Bls, boot, KVER, &mid(), Some(0));
        assert_eq!(p.file_name(), format!("{MID}-{KVER}+0.conf"));
    }

    #[test]
    fn test_layout_strings() {
        for l in [Layout::Bls, Layout::Uki] {
            assert_eq!(Layout::try_from(l.to_string().as_str()).unwrap(), l);
        }
        assert!(Layout::try_from("other").is_err());
        assert_eq!(Layout::default(), Layout::Uki);
    }

    #[test]
    fn test_kernel_version() {
        validate_kernel_version(KVER).unwrap();
        for bad in ["", ".", "..", "6.9/../..", "6.9 1", "6.9\n"] {
            assert!(validate_kernel_version(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_split_entry_dir() {
        let m = &mid();
        let ok = |p: &str| split_entry_dir(Utf8Path::new(p), m, KVER).map(|p| p.to_string());
        assert_eq!(ok(&format!("/boot/efi/{MID}/{KVER}")).unwrap(), "/boot/efi");
        // trailing slash
        assert_eq!(ok(&format!("/boot/{MID}/{KVER}/")).unwrap(), "/boot");
        // boot root at the top
        assert_eq!(ok(&format!("/{MID}/{KVER}")).unwrap(), "/");
        // relative
        assert!(ok(&format!("boot/{MID}/{KVER}")).is_err());
        // mismatched version
        assert!(ok(&format!("/boot/{MID}/6.8.0")).is_err());
        // mismatched machine ID
        assert!(ok(&format!("/boot/fedora/{KVER}")).is_err());
        // too short
        assert!(ok(&format!("/{KVER}")).is_err());
        assert!(ok("/").is_err());
    }

    #[test]
    fn test_derive_boot_root() -> Result<()> {
        let td = tempfile::tempdir()?;
        let base = Utf8Path::from_path(td.path()).unwrap();
        let entry_dir = base.join(MID).join(KVER);
        assert_eq!(derive_boot_root(&entry_dir, &mid(), KVER)?, base);
        let missing = base.join("nonexistent").join(MID).join(KVER);
        assert!(derive_boot_root(&missing, &mid(), KVER).is_err());
        Ok(())
    }

    #[test]
    fn test_artifact_pattern() -> Result<()> {
        let pat = ArtifactPattern::new(Layout::Uki, KVER, &mid())?;
        for name in [
            format!("{KVER}-{MID}.efi"),
            format!("{KVER}-{MID}+3.efi"),
            format!("{KVER}-{MID}+2-1.efi"),
        ] {
            assert!(pat.matches(&name), "{name}");
        }
        for name in [
            format!("{KVER}-{MID}.conf"),
            format!("{KVER}-{MID}.efi.bak"),
            format!("{KVER}-{MID}+.efi"),
            format!("{KVER}-{MID}+x.efi"),
            format!("{KVER}.1-{MID}.efi"),
            format!("x{KVER}-{MID}.efi"),
            // The dots in the version are literal
            format!("6x9x1-200.fc40.x86_64-{MID}.efi"),
        ] {
            assert!(!pat.matches(&name), "{name}");
        }
        let pat = ArtifactPattern::new(Layout::Bls, KVER, &mid())?;
        assert!(pat.matches(&format!("{MID}-{KVER}+1.conf")));
        assert!(!pat.matches(&format!("{KVER}-{MID}.efi")));
        Ok(())
    }

    #[test]
    fn test_remove_matching() -> Result<()> {
        let td = tempfile::tempdir()?;
        let boot = Dir::open_ambient_dir(td.path(), cap_std::ambient_authority())?;
        let pat = ArtifactPattern::new(Layout::Uki, KVER, &mid())?;
        assert!(pat.remove_matching(&boot)?.is_empty());

        boot.create_dir_all(EFI_LINUX)?;
        let d = boot.open_dir(EFI_LINUX)?;
        d.write(format!("{KVER}-{MID}.efi"), "uki")?;
        d.write(format!("{KVER}-{MID}+1-2.efi"), "uki")?;
        d.write(format!("6.8.0-{MID}.efi"), "other kernel")?;
        d.write(format!("{KVER}-{MID}.efi.orig"), "unrelated")?;
        let removed = pat.remove_matching(&boot)?;
        assert_eq!(
            removed,
            [format!("{KVER}-{MID}+1-2.efi"), format!("{KVER}-{MID}.efi")]
        );
        assert!(d.try_exists(format!("6.8.0-{MID}.efi"))?);
        assert!(d.try_exists(format!("{KVER}-{MID}.efi.orig"))?);
        assert!(pat.remove_matching(&boot)?.is_empty());
        Ok(())
    }
}
