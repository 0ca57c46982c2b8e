use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use qemu_harness::{Harness, HarnessConfig, InstanceId};
use regex::Regex;

#[derive(Parser)]
#[command(name = "qemu-harness", about = "Boot a QEMU guest and drive it over its serial pipes")]
struct Cli {
    /// JSON harness configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Launcher that boots the guest and creates its pipes
    #[arg(long)]
    launcher: Option<PathBuf>,

    /// Directory the launcher runs in and creates its pipes in
    #[arg(long)]
    pipe_dir: Option<PathBuf>,

    /// Seconds without console output before the guest is killed
    #[arg(short, long)]
    watchdog_secs: Option<u64>,

    /// Instance index, selects the pipe names
    #[arg(short, long, default_value = "0")]
    instance: u32,

    /// Extra launcher arguments, split with shell quoting rules
    #[arg(short, long, default_value = "")]
    boot_args: String,

    /// Address to give eth0 once the guest is up
    #[arg(long)]
    ip: Option<String>,

    /// Command to run on the guest console (repeatable)
    #[arg(short = 'x', long = "exec")]
    exec: Vec<String>,

    /// Expected console output pattern (regex)
    #[arg(short, long)]
    expect: Option<String>,

    /// Command that powers the guest off; the run then waits for "Power down."
    #[arg(long)]
    shutdown_command: Option<String>,

    /// Run the launcher's cleanup and remove pipe files afterwards
    #[arg(long)]
    cleanup: bool,
}

impl Cli {
    fn harness_config(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)?,
            None => HarnessConfig::default(),
        };
        if let Some(launcher) = &self.launcher {
            config.launcher = launcher.clone();
        }
        if let Some(dir) = &self.pipe_dir {
            config.pipe_dir = dir.clone();
        }
        if let Some(secs) = self.watchdog_secs {
            config.watchdog_interval_ms = secs.saturating_mul(1000);
        }
        Ok(config)
    }
}

async fn run(cli: &Cli, harness: &Harness, id: InstanceId) -> Result<()> {
    let expect = cli
        .expect
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid --expect pattern")?;

    harness
        .start(id, &cli.boot_args)
        .await
        .with_context(|| format!("booting instance {id}"))?;
    harness.wait_for_init(id).await?;

    if let Some(ip) = &cli.ip {
        harness.set_ip(id, ip).await?;
    }
    for command in &cli.exec {
        tracing::info!(instance = %id, %command, "executing");
        harness.execute(id, command).await?;
    }
    if let Some(pattern) = &expect {
        let line = harness.expect_line(id, pattern).await?;
        println!("{line}");
    }
    if let Some(command) = &cli.shutdown_command {
        harness.write_line(id, command).await?;
        harness.expect_power_down(id).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = cli.harness_config()?;
    let id = InstanceId(cli.instance);

    tracing::info!(
        launcher = %config.launcher.display(),
        instance = %id,
        boot_args = %cli.boot_args,
        "Launching QEMU test"
    );

    let harness = Harness::new(config);
    let outcome = run(&cli, &harness, id).await;

    harness.kill(id);
    if cli.cleanup {
        harness.cleanup_shared_resources().await;
    }

    match &outcome {
        Ok(()) => println!("qemu-harness: instance {id} passed"),
        Err(err) => {
            tracing::error!(instance = %id, last_line = ?harness.last_line(id), "{err:#}");
        }
    }
    outcome
}
