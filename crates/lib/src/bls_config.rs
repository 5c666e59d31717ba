//! See <https://uapi-group.org/specifications/specs/boot_loader_specification/>
//!
//! This module parses and renders Type #1 loader entries.

use std::collections::BTreeMap;
use std::fmt::Display;

use anyhow::{anyhow, Result};

/// Represents a single Boot Loader Specification config file.
#[derive(Debug, Eq, PartialEq, Default)]
pub(crate) struct BLSConfig {
    /// The title of the boot entry, to be displayed in the boot menu.
    pub(crate) title: Option<String>,
    /// The version of the boot entry.
    pub(crate) version: String,
    /// The machine ID of the OS.
    pub(crate) machine_id: Option<String>,
    /// The sort key for the boot menu.
    pub(crate) sort_key: Option<String>,
    /// The path to the linux kernel to boot.
    pub(crate) linux: String,
    /// The paths to the initrd images.
    pub(crate) initrd: Vec<String>,
    /// Kernel command line options.
    pub(crate) options: Option<String>,

    /// Keys not known to the Boot Loader Specification, kept sorted so that
    /// rendering is stable.
    pub(crate) extra: BTreeMap<String, String>,
}

impl Display for BLSConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(title) = &self.title {
            writeln!(f, "title {}", title)?;
        }
        writeln!(f, "version {}", self.version)?;
        if let Some(machine_id) = self.machine_id.as_deref() {
            writeln!(f, "machine-id {}", machine_id)?;
        }
        if let Some(sort_key) = self.sort_key.as_deref() {
            writeln!(f, "sort-key {}", sort_key)?;
        }
        if let Some(options) = self.options.as_deref() {
            writeln!(f, "options {}", options)?;
        }
        writeln!(f, "linux {}", self.linux)?;
        for initrd in self.initrd.iter() {
            writeln!(f, "initrd {}", initrd)?;
        }
        for (key, value) in &self.extra {
            writeln!(f, "{} {}", key, value)?;
        }
        Ok(())
    }
}

impl BLSConfig {
    /// Drop every existing initrd line in favor of a single one.
    pub(crate) fn replace_initrds(&mut self, initrd: impl Into<String>) {
        let previous = std::mem::replace(&mut self.initrd, vec![initrd.into()]);
        for p in previous {
            tracing::debug!("Dropping initrd line: {p}");
        }
    }
}

pub(crate) fn parse_bls_config(input: &str) -> Result<BLSConfig> {
    let mut title = None;
    let mut version = None;
    let mut linux = None;
    let mut initrd = Vec::new();
    let mut options = None;
    let mut machine_id = None;
    let mut sort_key = None;
    let mut extra = BTreeMap::new();

    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Keys and values may be separated by any whitespace
        let Some((key, value)) = line.split_once(|c: char| c.is_ascii_whitespace()) else {
            continue;
        };
        let value = value.trim().to_string();
        match key {
            "title" => title = Some(value),
            "version" => version = Some(value),
            "linux" => linux = Some(value),
            "initrd" => initrd.push(value),
            "options" => options = Some(value),
            "machine-id" => machine_id = Some(value),
            "sort-key" => sort_key = Some(value),
            _ => {
                extra.insert(key.to_string(), value);
            }
        }
    }

    let linux = linux.ok_or_else(|| anyhow!("Missing 'linux' value"))?;
    let version = version.ok_or_else(|| anyhow!("Missing 'version' value"))?;

    Ok(BLSConfig {
        title,
        version,
        machine_id,
        sort_key,
        linux,
        initrd,
        options,
        extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    const LOADERENTRY: &str = indoc! { r#"
        # Boot Loader Specification type#1 entry
        title      Fedora Linux 40 (Workstation Edition)
        version    6.9.1-200.fc40.x86_64
        machine-id 0123456789abcdef0123456789abcdef
        sort-key   fedora
        options    root=UUID=abc ro rhgb quiet
        linux      /0123456789abcdef0123456789abcdef/6.9.1-200.fc40.x86_64/linux
        initrd     /0123456789abcdef0123456789abcdef/6.9.1-200.fc40.x86_64/microcode.img
        initrd     /0123456789abcdef0123456789abcdef/6.9.1-200.fc40.x86_64/initrd
        architecture x64
    "# };

    #[test]
    fn test_parse_loaderentry() -> Result<()> {
        let config = parse_bls_config(LOADERENTRY)?;
        assert_eq!(
            config.title.as_deref(),
            Some("Fedora Linux 40 (Workstation Edition)")
        );
        assert_eq!(config.version, "6.9.1-200.fc40.x86_64");
        assert_eq!(config.sort_key.as_deref(), Some("fedora"));
        assert_eq!(config.options.as_deref(), Some("root=UUID=abc ro rhgb quiet"));
        assert_eq!(config.initrd.len(), 2);
        assert_eq!(config.extra.get("architecture").map(|s| s.as_str()), Some("x64"));
        Ok(())
    }

    #[test]
    fn test_parse_missing_required() {
        assert!(parse_bls_config("title Fedora\nlinux /vmlinuz\n").is_err());
        assert!(parse_bls_config("title Fedora\nversion 1\n").is_err());
    }

    #[test]
    fn test_replace_initrds() -> Result<()> {
        let mut config = parse_bls_config(LOADERENTRY)?;
        config.replace_initrds("/0123456789abcdef0123456789abcdef/6.9.1-200.fc40.x86_64/initrd");
        similar_asserts::assert_eq!(
            config.to_string(),
            indoc! { r#"
                title Fedora Linux 40 (Workstation Edition)
                version 6.9.1-200.fc40.x86_64
                machine-id 0123456789abcdef0123456789abcdef
                sort-key fedora
                options root=UUID=abc ro rhgb quiet
                linux /0123456789abcdef0123456789abcdef/6.9.1-200.fc40.x86_64/linux
                initrd /0123456789abcdef0123456789abcdef/6.9.1-200.fc40.x86_64/initrd
                architecture x64
            "# }
        );
        Ok(())
    }
}
