use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::instance::{Instance, InstanceId, KillReason};

/// Watches the launcher's own stdout/stderr. Once both close the launcher is
/// gone (or going), so the instance is killed and the child reaped.
///
/// Racing an explicit shutdown is fine: whichever kill comes second is a
/// no-op.
pub(crate) fn spawn(instance: Arc<Instance>, mut child: Child) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = instance.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::join!(drain(id, "stdout", stdout), drain(id, "stderr", stderr));

        instance.kill(KillReason::ProcessExited);

        match child.wait().await {
            Ok(status) => info!(instance = %id, %status, "launcher exited"),
            Err(err) => warn!(instance = %id, %err, "failed to reap launcher"),
        }
    })
}

async fn drain<R: AsyncRead + Unpin>(id: InstanceId, stream: &'static str, reader: Option<R>) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(instance = %id, stream, %line, "launcher output"),
            Ok(None) => break,
            Err(err) => {
                warn!(instance = %id, stream, %err, "launcher output unreadable");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{process::Stdio, time::Duration};

    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::process::Command;

    fn piped(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn spontaneous_exit_kills_instance() {
        let instance = Instance::new(InstanceId(0));
        let child = piped("sh", &["-c", "echo booting; echo oops >&2; exit 3"]);
        instance.set_pid(child.id());

        let handle = spawn(instance.clone(), child);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher should finish")
            .unwrap();

        assert!(!instance.is_running());
        assert_eq!(instance.killed_by(), Some(KillReason::ProcessExited));
    }

    #[tokio::test]
    async fn explicit_kill_wins_the_race() {
        let instance = Instance::new(InstanceId(1));
        let child = piped("sleep", &["30"]);
        instance.set_pid(child.id());
        let handle = spawn(instance.clone(), child);

        instance.kill(KillReason::Shutdown);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher should see the interrupted launcher")
            .unwrap();

        assert_eq!(instance.killed_by(), Some(KillReason::Shutdown));
    }
}
