//! Invoking the external initramfs and unified kernel image builder.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use sdboot_utils::CommandRunExt;

use crate::config::Settings;
use crate::errors::HookError;
use crate::kernel_cmdline::BootOptions;

/// Everything needed to produce one image.
#[derive(Debug)]
pub(crate) struct BuildRequest<'a> {
    pub(crate) kernel_version: &'a str,
    /// The kernel to embed in a unified image
    pub(crate) kernel_image: &'a Utf8Path,
    pub(crate) cmdline: &'a BootOptions,
    /// Final location of the artifact
    pub(crate) output: &'a Utf8Path,
    /// Build a unified EFI executable instead of a bare initrd
    pub(crate) uefi: bool,
    /// The builder may skip host-specific content
    pub(crate) no_image_if_not_needed: bool,
}

/// Something that can produce an initrd or unified kernel image.
pub(crate) trait ImageBuilder {
    /// Build the requested image at `request.output`. On error, nothing
    /// must have been written there. Returns `false` if the builder
    /// decided no image was needed and wrote nothing.
    fn build(&self, request: &BuildRequest) -> Result<bool>;
}

/// The builder writes here first; the temporary file is removed on drop
/// unless [`StagedOutput::commit`] renamed it into place.
#[derive(Debug)]
struct StagedOutput {
    dir: Dir,
    temp_name: String,
    temp_path: Utf8PathBuf,
    name: String,
    done: bool,
}

impl StagedOutput {
    #[context("Staging {output}")]
    fn new(output: &Utf8Path) -> Result<Self> {
        let (Some(parent), Some(name)) = (output.parent(), output.file_name()) else {
            anyhow::bail!("Invalid output path");
        };
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .with_context(|| format!("Opening {parent}"))?;
        let temp_name = format!(".{name}.tmp");
        // Left over from an interrupted run
        dir.remove_file_optional(&temp_name)?;
        Ok(Self {
            temp_path: parent.join(&temp_name),
            dir,
            temp_name,
            name: name.to_owned(),
            done: false,
        })
    }

    /// Move the staged file into place. Returns `false` if the builder
    /// chose not to write anything.
    fn commit(mut self) -> Result<bool> {
        self.done = true;
        if !self.dir.try_exists(&self.temp_name)? {
            return Ok(false);
        }
        self.dir
            .rename(&self.temp_name, &self.dir, &self.name)
            .with_context(|| format!("Renaming {} to {}", self.temp_name, self.name))?;
        Ok(true)
    }
}

impl Drop for StagedOutput {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.dir.remove_file_optional(&self.temp_name) {
            tracing::warn!("Failed to clean up {}: {e}", self.temp_path);
        }
    }
}

#[derive(Debug)]
struct SecureBootKeys {
    key: Utf8PathBuf,
    cert: Utf8PathBuf,
}

/// The dracut image builder.
#[derive(Debug)]
pub(crate) struct Dracut {
    program: Utf8PathBuf,
    extra_args: Vec<String>,
    secureboot: Option<SecureBootKeys>,
}

impl Dracut {
    pub(crate) fn new(settings: &Settings) -> Self {
        Self {
            program: settings.builder.program.clone(),
            extra_args: settings.builder.args.clone(),
            secureboot: settings.secureboot.as_ref().map(|s| SecureBootKeys {
                key: s.key.clone(),
                cert: s.cert.clone(),
            }),
        }
    }

    fn command(&self, request: &BuildRequest, output: &Utf8Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--force", "--kernel-cmdline"]);
        cmd.arg(request.cmdline.join());
        if request.no_image_if_not_needed {
            cmd.arg("--noimageifnotneeded");
        }
        if request.uefi {
            cmd.arg("--uefi");
            cmd.arg("--kernel-image").arg(request.kernel_image);
            if let Some(sb) = self.secureboot.as_ref() {
                cmd.arg("--uefi-secureboot-key").arg(&sb.key);
                cmd.arg("--uefi-secureboot-cert").arg(&sb.cert);
            }
        }
        cmd.args(&self.extra_args);
        cmd.args(["--kver", request.kernel_version]);
        cmd.arg(output);
        cmd
    }
}

impl ImageBuilder for Dracut {
    fn build(&self, request: &BuildRequest) -> Result<bool> {
        let staged = StagedOutput::new(request.output)?;
        let status = self
            .command(request, &staged.temp_path)
            .log_debug()
            .run_status()?;
        if !status.success() {
            return Err(HookError::BuilderFailed {
                program: self.program.to_string(),
                status,
            }
            .into());
        }
        let built = staged.commit()?;
        if !built {
            tracing::info!("{} did not generate {}", self.program, request.output);
        }
        Ok(built)
    }
}
