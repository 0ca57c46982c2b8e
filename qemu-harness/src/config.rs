use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    error::{HarnessError, Result},
    instance::InstanceId,
};

const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 10_000;
const DEFAULT_PIPE_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_LAUNCH_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 1_000;

/// Matches the line the guest's init prints once userspace is up.
pub const DEFAULT_INIT_PATTERN: &str = r"^\[[^\]]*\] init running";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Program that boots a guest and creates its pipes.
    pub launcher: PathBuf,
    /// Passed to the launcher ahead of the per-instance `--pipe<id>` flag.
    pub launcher_args: Vec<String>,
    /// Launcher working directory; the pipes appear here.
    pub pipe_dir: PathBuf,
    pub watchdog_interval_ms: u64,
    pub pipe_poll_interval_ms: u64,
    pub launch_timeout_ms: u64,
    pub settle_delay_ms: u64,
    /// Launcher arguments for the end-of-run cleanup. Empty skips it.
    pub cleanup_args: Vec<String>,
    pub init_pattern: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            launcher: PathBuf::from("./boot_qemu"),
            launcher_args: Vec::new(),
            pipe_dir: PathBuf::from("."),
            watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            pipe_poll_interval_ms: DEFAULT_PIPE_POLL_INTERVAL_MS,
            launch_timeout_ms: DEFAULT_LAUNCH_TIMEOUT_MS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            cleanup_args: vec!["--cleanup".to_string()],
            init_pattern: DEFAULT_INIT_PATTERN.to_string(),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn pipe_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pipe_poll_interval_ms.max(1))
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Bare program names go through `PATH`; anything with a separator is
    /// taken relative to `pipe_dir`, where the launcher runs.
    pub fn resolve_launcher(&self) -> Result<PathBuf> {
        if self.launcher.components().count() > 1 || self.launcher.is_absolute() {
            return Ok(self.launcher.clone());
        }
        which::which(&self.launcher).map_err(|source| HarnessError::LauncherNotFound {
            program: self.launcher.clone(),
            source,
        })
    }

    /// Arguments for booting instance `id`; `boot_args` is split with shell
    /// quoting rules.
    pub fn launch_args(&self, id: InstanceId, boot_args: &str) -> Result<Vec<OsString>> {
        let extra = shlex::split(boot_args).ok_or_else(|| HarnessError::InvalidArguments {
            args: boot_args.to_string(),
        })?;
        let mut args: Vec<OsString> = self.launcher_args.iter().map(OsString::from).collect();
        args.push(format!("--pipe{id}").into());
        args.extend(extra.into_iter().map(OsString::from));
        Ok(args)
    }

    pub fn cleanup_command_args(&self) -> Option<Vec<OsString>> {
        if self.cleanup_args.is_empty() {
            return None;
        }
        let mut args: Vec<OsString> = self.launcher_args.iter().map(OsString::from).collect();
        args.extend(self.cleanup_args.iter().map(OsString::from));
        Some(args)
    }
}
