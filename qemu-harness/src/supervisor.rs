use std::{io, process::Stdio};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    harness::Harness,
    instance::{Instance, InstanceId, KillReason, PipePaths},
};

impl Instance {
    /// Terminates the instance. Only the first call does anything; it returns
    /// `true` for that call and `false` for every later one.
    ///
    /// Under the state lock: interrupt the process, cancel the in-flight read,
    /// drop all four pipes, mark the instance dead. A reader blocked on the
    /// pipe observes the cancellation and fails with `ReadCancelled`.
    ///
    /// Pipe files on disk are left alone; see
    /// [`Harness::cleanup_shared_resources`].
    pub fn kill(&self, reason: KillReason) -> bool {
        let mut state = self.lock_state();
        if !state.running {
            debug!(instance = %self.id(), %reason, "kill on dead instance ignored");
            return false;
        }

        if let Some(pid) = state.pid {
            if let Err(err) = interrupt(pid, state.process_group) {
                warn!(instance = %self.id(), pid, %err, "failed to signal launcher");
            }
        }
        if let Some(read) = state.in_flight.take() {
            read.token.cancel();
        }
        state.pipes = None;
        state.running = false;
        state.killed_by = Some(reason);
        let last_line = state.last_line.clone();
        drop(state);

        self.shutdown_token().cancel();
        info!(
            instance = %self.id(),
            %reason,
            last_line = last_line.as_deref().unwrap_or("<none>"),
            "instance killed"
        );
        true
    }
}

/// Sends SIGINT to `pid`, or to its whole process group so that qemu and
/// anything else the launcher forked goes down with it.
fn interrupt(pid: u32, group: bool) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let target = if group { -pid } else { pid };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(target, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl Harness {
    /// Terminates instance `id`. Unknown or already dead ids are a no-op.
    pub fn kill(&self, id: InstanceId) {
        match self.instance(id) {
            Ok(instance) => {
                instance.kill(KillReason::Shutdown);
            }
            Err(err) => debug!(instance = %id, %err, "kill ignored"),
        }
    }

    /// Best-effort end-of-run reclamation: kills every registered instance,
    /// runs the launcher's cleanup mode, and removes every registered
    /// instance's pipe files. Failures are logged, never returned.
    pub async fn cleanup_shared_resources(&self) {
        for instance in self.registry().all() {
            instance.kill(KillReason::Cleanup);
        }

        if let Some(args) = self.config().cleanup_command_args() {
            match self.config().resolve_launcher() {
                Ok(program) => {
                    let output = Command::new(&program)
                        .args(&args)
                        .current_dir(&self.config().pipe_dir)
                        .stdin(Stdio::null())
                        .output()
                        .await;
                    match output {
                        Ok(out) if out.status.success() => {
                            debug!(program = %program.display(), "launcher cleanup finished");
                        }
                        Ok(out) => warn!(
                            program = %program.display(),
                            status = %out.status,
                            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                            "launcher cleanup failed"
                        ),
                        Err(err) => {
                            warn!(program = %program.display(), %err, "launcher cleanup failed");
                        }
                    }
                }
                Err(err) => warn!(%err, "skipping launcher cleanup"),
            }
        }

        for id in self.registry().ids() {
            let paths = PipePaths::new(&self.config().pipe_dir, id);
            for path in paths.in_open_order() {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(instance = %id, path = %path.display(), "removed pipe"),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(instance = %id, path = %path.display(), %err, "failed to remove pipe");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{config::HarnessConfig, error::HarnessError, test_support::duplex_pipes};
    use pretty_assertions::assert_eq;

    #[test]
    fn second_kill_is_a_no_op() {
        let instance = Instance::new(InstanceId(0));
        assert!(instance.kill(KillReason::Shutdown));
        assert!(!instance.kill(KillReason::Watchdog));
        assert!(!instance.is_running());
        assert_eq!(instance.killed_by(), Some(KillReason::Shutdown));
    }

    #[tokio::test]
    async fn kill_interrupts_the_launcher() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let instance = Instance::new(InstanceId(0));
        instance.set_pid(child.id());
        instance.kill(KillReason::Shutdown);
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGINT));
    }

    #[tokio::test]
    async fn kill_interrupts_the_launchers_whole_group() {
        // The shell stays around waiting on sleep, and sleep holds stdout
        // open, so stdout only closes once both are gone.
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30; echo finished"])
            .process_group(0)
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let instance = Instance::new(InstanceId(0));
        instance.set_group_leader(child.id());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        instance.kill(KillReason::Shutdown);

        let mut output = String::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            stdout.read_to_string(&mut output),
        )
        .await
        .expect("forked child should die with the launcher")
        .unwrap();
        assert_eq!(output, "");
        assert!(!child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn kill_drops_pipes_and_fails_later_io() {
        let harness = Harness::new(HarnessConfig::default());
        let (pipes, _guest) = duplex_pipes();
        harness.attach(InstanceId(0), pipes, None).unwrap();
        harness.kill(InstanceId(0));
        harness.kill(InstanceId(0));
        assert!(!harness.is_running(InstanceId(0)));
        assert!(matches!(
            harness.write_line(InstanceId(0), "ls").await,
            Err(HarnessError::InstanceDead { reason: Some(KillReason::Shutdown), .. })
        ));
    }

    #[tokio::test]
    async fn kill_of_unknown_instance_is_ignored() {
        let harness = Harness::new(HarnessConfig::default());
        harness.kill(InstanceId(7));
        assert!(harness.ids().is_empty());
    }

    #[tokio::test]
    async fn cleanup_kills_everything_and_removes_pipe_files() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(HarnessConfig {
            pipe_dir: dir.path().to_path_buf(),
            cleanup_args: Vec::new(),
            ..HarnessConfig::default()
        });
        for id in [0, 1] {
            let paths = PipePaths::new(dir.path(), InstanceId(id));
            for path in paths.in_open_order() {
                std::fs::write(path, b"").unwrap();
            }
            let (pipes, _guest) = duplex_pipes();
            harness.attach(InstanceId(id), pipes, None).unwrap();
        }

        harness.cleanup_shared_resources().await;

        for id in [InstanceId(0), InstanceId(1)] {
            assert!(!harness.is_running(id));
            assert_eq!(
                harness.instance(id).unwrap().killed_by(),
                Some(KillReason::Cleanup)
            );
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
