//! # Configuration for the kernel-install hook
//!
//! Settings are read from the first of [`CONFIG_PATHS`] that exists;
//! the vendor default in `/usr/lib` is overridden as a whole by a
//! file in `/etc`.

use std::io::Read;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::Deserialize;

use crate::entry::Layout;

/// Candidate settings files relative to the host root, in priority order.
pub(crate) const CONFIG_PATHS: &[&str] =
    &["etc/sdboot/install.toml", "usr/lib/sdboot/install.toml"];

/// Environment variable set by kernel-install to the configured layout.
pub(crate) const LAYOUT_ENV: &str = "KERNEL_INSTALL_LAYOUT";

/// The image builder invocation.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct BuilderSettings {
    /// The program to run; must accept dracut's arguments
    #[serde(default = "default_builder_program")]
    pub(crate) program: Utf8PathBuf,
    /// Additional arguments, inserted before the output path
    #[serde(default)]
    pub(crate) args: Vec<String>,
}

fn default_builder_program() -> Utf8PathBuf {
    "dracut".into()
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            program: default_builder_program(),
            args: Vec::new(),
        }
    }
}

/// Keys used to sign unified kernel images.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct SecureBootSettings {
    pub(crate) key: Utf8PathBuf,
    pub(crate) cert: Utf8PathBuf,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct PackageSettings {
    /// Command run on removal to drop the package record for the kernel;
    /// `{kver}` is replaced by the kernel version. Unset means disabled.
    pub(crate) deregister: Option<Vec<String>>,
}

/// The toplevel settings file.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct Settings {
    pub(crate) layout: Option<Layout>,
    #[serde(default)]
    pub(crate) builder: BuilderSettings,
    pub(crate) secureboot: Option<SecureBootSettings>,
    #[serde(default)]
    pub(crate) package: PackageSettings,
}

impl Settings {
    fn parse(path: &str, text: &str) -> Result<Self> {
        toml::from_str(text).with_context(|| format!("Parsing {path}"))
    }

    /// Load settings from the first candidate path under `root`.
    #[context("Loading settings")]
    pub(crate) fn load(root: &Dir) -> Result<Self> {
        for path in CONFIG_PATHS {
            let Some(mut f) = root
                .open_optional(path)
                .with_context(|| format!("Opening /{path}"))?
            else {
                continue;
            };
            let mut buf = String::new();
            f.read_to_string(&mut buf)
                .with_context(|| format!("Reading /{path}"))?;
            tracing::debug!("Using settings from /{path}");
            return Self::parse(&format!("/{path}"), &buf);
        }
        Ok(Self::default())
    }

    /// Load settings from an explicitly provided file.
    #[context("Loading settings from {path}")]
    pub(crate) fn load_from(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(path.as_str(), &buf)
    }
}

/// Pick the layout: explicit flag, then the value exported by
/// kernel-install, then the settings file.
pub(crate) fn resolve_layout(
    flag: Option<Layout>,
    env: Option<&str>,
    settings: &Settings,
) -> Layout {
    if let Some(layout) = flag {
        return layout;
    }
    if let Some(v) = env.filter(|v| !v.is_empty()) {
        match Layout::try_from(v) {
            Ok(layout) => return layout,
            // e.g. "other", meaning a different plugin owns the layout
            Err(_) => tracing::debug!("Ignoring {LAYOUT_ENV}={v}"),
        }
    }
    settings.layout.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    use cap_std_ext::cap_std;
    use indoc::indoc;

    #[test]
    fn test_parse_full() -> Result<()> {
        let s = Settings::parse(
            "test",
            indoc! { r#"
                layout = "bls"

                [builder]
                program = "/usr/bin/dracut"
                args = ["--hostonly"]

                [secureboot]
                key = "/var/lib/sbctl/keys/db/db.key"
                cert = "/var/lib/sbctl/keys/db/db.pem"

                [package]
                deregister = ["rpm", "--erase", "--nodeps", "--justdb", "kernel-core-{kver}"]
            "# },
        )?;
        assert_eq!(s.layout, Some(Layout::Bls));
        assert_eq!(s.builder.program, "/usr/bin/dracut");
        assert_eq!(s.builder.args, ["--hostonly"]);
        let sb = s.secureboot.as_ref().unwrap();
        assert_eq!(sb.cert, "/var/lib/sbctl/keys/db/db.pem");
        assert_eq!(s.package.deregister.as_ref().unwrap().len(), 5);
        Ok(())
    }

    #[test]
    fn test_parse_defaults() -> Result<()> {
        let s = Settings::parse("test", "")?;
        assert_eq!(s, Settings::default());
        assert_eq!(s.builder.program, "dracut");
        assert!(s.package.deregister.is_none());

        let s = Settings::parse("test", "[builder]\nargs = [\"-v\"]\n")?;
        assert_eq!(s.builder.program, "dracut");
        Ok(())
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Settings::parse("test", "layout = \"other\"").is_err());
        assert!(Settings::parse("test", "unknown = 1").is_err());
        assert!(Settings::parse("test", "[secureboot]\nkey = \"/k\"").is_err());
    }

    #[test]
    fn test_load_precedence() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = &Dir::open_ambient_dir(td.path(), cap_std::ambient_authority())?;
        assert_eq!(Settings::load(root)?, Settings::default());

        root.create_dir_all("usr/lib/sdboot")?;
        root.write("usr/lib/sdboot/install.toml", "layout = \"bls\"\n")?;
        assert_eq!(Settings::load(root)?.layout, Some(Layout::Bls));

        root.create_dir_all("etc/sdboot")?;
        root.write("etc/sdboot/install.toml", "layout = \"uki\"\n")?;
        assert_eq!(Settings::load(root)?.layout, Some(Layout::Uki));

        root.write("etc/sdboot/install.toml", "layout = 42\n")?;
        let e = Settings::load(root).unwrap_err();
        assert!(format!("{e:#}").contains("/etc/sdboot/install.toml"));
        Ok(())
    }

    #[test]
    fn test_resolve_layout() {
        let bls = Settings {
            layout: Some(Layout::Bls),
            ..Default::default()
        };
        let default = Settings::default();
        assert_eq!(resolve_layout(None, None, &default), Layout::Uki);
        assert_eq!(resolve_layout(None, None, &bls), Layout::Bls);
        assert_eq!(resolve_layout(None, Some("uki"), &bls), Layout::Uki);
        assert_eq!(resolve_layout(None, Some("other"), &bls), Layout::Bls);
        assert_eq!(resolve_layout(None, Some(""), &bls), Layout::Bls);
        assert_eq!(
            resolve_layout(Some(Layout::Bls), Some("uki"), &default),
            Layout::Bls
        );
    }
}
