use std::{ffi::OsString, path::Path, process::Stdio, sync::Arc};

use tokio::{process::Command, time::Instant};
use tracing::{debug, info};

use crate::{
    error::{HarnessError, Result},
    exit_watcher,
    harness::Harness,
    instance::{Channel, Instance, InstanceId, KillReason, PipePaths, Pipes},
    watchdog,
};

impl Harness {
    /// Boots instance `id`: spawns the launcher with `--pipe<id>` and
    /// `boot_args`, waits for its four pipes, starts the watchdog, and
    /// swallows the monitor's greeting on the control pipe.
    ///
    /// Any failure after the id is registered leaves the instance dead.
    pub async fn start(&self, id: InstanceId, boot_args: &str) -> Result<()> {
        let program = self.config().resolve_launcher()?;
        let args = self.config().launch_args(id, boot_args)?;
        let instance = self.registry().register(id)?;

        let launched = self.launch(&instance, &program, &args).await;
        if launched.is_err() {
            instance.kill(KillReason::LaunchFailed);
        }
        launched
    }

    async fn launch(&self, instance: &Arc<Instance>, program: &Path, args: &[OsString]) -> Result<()> {
        let id = instance.id();
        let child = Command::new(program)
            .args(args)
            .current_dir(&self.config().pipe_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| HarnessError::Spawn { id, source })?;
        instance.set_group_leader(child.id());
        info!(
            instance = %id,
            pid = ?child.id(),
            program = %program.display(),
            ?args,
            "launcher started"
        );
        exit_watcher::spawn(instance.clone(), child);

        let paths = PipePaths::new(&self.config().pipe_dir, id);
        self.wait_for_pipes(instance, &paths).await?;
        instance.install_pipes(Pipes::open(id, &paths)?)?;
        info!(instance = %id, "pipes open");

        watchdog::spawn(instance.clone(), self.config().watchdog_interval());

        match instance.read_line(Channel::Control).await {
            Ok(banner) => {
                debug!(instance = %id, %banner, "skipped monitor banner");
                Ok(())
            }
            Err(HarnessError::ReadCancelled { .. } | HarnessError::InstanceDead { .. }) => {
                let reason = instance
                    .killed_by()
                    .map_or_else(|| "no kill recorded".to_string(), |r| r.to_string());
                let last_line = instance.last_line();
                Err(HarnessError::ProtocolViolation {
                    id,
                    detail: format!(
                        "monitor banner never arrived on the control pipe ({reason}; last line: {})",
                        last_line.as_deref().unwrap_or("<none>")
                    ),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Polls for each pipe in open order until it exists, the instance dies,
    /// or the launch timeout runs out.
    async fn wait_for_pipes(&self, instance: &Instance, paths: &PipePaths) -> Result<()> {
        let started = Instant::now();
        let timeout = self.config().launch_timeout();
        let poll = self.config().pipe_poll_interval();
        let shutdown = instance.shutdown_token();

        for path in paths.in_open_order() {
            while !path.exists() {
                if !instance.is_running() {
                    return Err(instance.dead_error());
                }
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(HarnessError::LaunchTimeout {
                        id: instance.id(),
                        path: path.to_path_buf(),
                        waited,
                    });
                }
                info!(instance = %instance.id(), path = %path.display(), "waiting for pipe");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
        Ok(())
    }
}
