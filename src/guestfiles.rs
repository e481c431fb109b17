//! Guest metadata injection.
//!
//! After flattening, two plaintext files are written into the rootfs for the
//! guest init program:
//!
//! - `walkio/env`: each `KEY=VALUE` env entry on its own line, followed by a
//!   final `WORKDIR=<dir>` line (no trailing newline).
//! - `walkio/argv`: each entrypoint element, then each cmd element, one per
//!   line. No quoting or escaping.
//!
//! These files are the ABI with the guest init and must not change format
//! without guest-side coordination.

use crate::constants::{GUEST_ARGV_FILE, GUEST_CONFIG_DIR, GUEST_ENV_FILE};
use crate::error::Result;
use crate::source::ImageConfig;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Injects metadata into a flattened rootfs before device creation.
pub trait ConfigWriter {
    fn write_config(&self, rootfs_dir: &Path, config: &ImageConfig) -> Result<()>;
}

/// Writes the `walkio/env` and `walkio/argv` guest files.
#[derive(Debug, Default)]
pub struct AppConfigWriter;

impl AppConfigWriter {
    pub fn new() -> Self {
        Self
    }
}

impl ConfigWriter for AppConfigWriter {
    fn write_config(&self, rootfs_dir: &Path, config: &ImageConfig) -> Result<()> {
        let config_dir = rootfs_dir.join(GUEST_CONFIG_DIR);
        create_dir_with_mode(&config_dir, 0o755)?;

        write_guest_file(&config_dir.join(GUEST_ENV_FILE), &render_env(config))?;
        write_guest_file(&config_dir.join(GUEST_ARGV_FILE), &render_argv(config))?;

        Ok(())
    }
}

/// No-op writer for wiring tests.
#[derive(Debug, Default)]
pub struct NoOpConfigWriter;

impl NoOpConfigWriter {
    pub fn new() -> Self {
        Self
    }
}

impl ConfigWriter for NoOpConfigWriter {
    fn write_config(&self, _rootfs_dir: &Path, _config: &ImageConfig) -> Result<()> {
        Ok(())
    }
}

fn render_env(config: &ImageConfig) -> String {
    let mut out = String::new();
    for line in &config.env {
        out.push_str(line.trim());
        out.push('\n');
    }

    let workdir = if config.working_dir.is_empty() {
        "/"
    } else {
        &config.working_dir
    };
    out.push_str("WORKDIR=");
    out.push_str(workdir);
    out
}

fn render_argv(config: &ImageConfig) -> String {
    let mut out = String::new();
    for line in config.entrypoint.iter().chain(config.cmd.iter()) {
        out.push_str(line.trim());
        out.push('\n');
    }
    out
}

fn create_dir_with_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
}

fn write_guest_file(path: &Path, content: &str) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
