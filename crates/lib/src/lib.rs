//! # systemd-boot kernel-install hook
//!
//! This crate installs kernels for systemd-boot when invoked by
//! kernel-install(8): either as a unified kernel image in `EFI/Linux`,
//! or as a Type #1 loader entry with a separate kernel and initrd.
//! The initrd or image itself is generated by dracut.

mod bls_config;
mod builder;
pub mod cli;
mod config;
mod entry;
mod errors;
mod hook;
mod kernel_cmdline;
mod package;
mod sysconf;
