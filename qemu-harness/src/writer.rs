use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::{
    error::{HarnessError, Result},
    harness::Harness,
    instance::{dead, Channel, Instance, InstanceId},
};

impl Instance {
    /// Writes `text` plus a newline and flushes, so the guest sees each line
    /// as soon as it is written.
    pub async fn write_line(&self, channel: Channel, text: &str) -> Result<()> {
        let sink = {
            let state = self.lock_state();
            match state.pipes.as_ref() {
                Some(pipes) if state.running => pipes.sink(channel),
                _ => return Err(dead(self.id(), &state)),
            }
        };

        let io_err = |source| HarnessError::Io {
            id: self.id(),
            channel,
            source,
        };
        let mut sink = sink.lock().await;
        sink.write_all(text.as_bytes()).await.map_err(io_err)?;
        sink.write_all(b"\n").await.map_err(io_err)?;
        sink.flush().await.map_err(io_err)?;
        trace!(instance = %self.id(), %channel, %text, "wrote");
        Ok(())
    }
}

impl Harness {
    pub async fn write_line(&self, id: InstanceId, text: &str) -> Result<()> {
        self.instance(id)?.write_line(Channel::Console, text).await
    }

    pub async fn write_control_line(&self, id: InstanceId, text: &str) -> Result<()> {
        self.instance(id)?.write_line(Channel::Control, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::HarnessConfig, instance::KillReason, test_support::duplex_pipes};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn each_write_is_one_terminated_line() {
        let harness = Harness::new(HarnessConfig::default());
        let (pipes, mut guest) = duplex_pipes();
        harness.attach(InstanceId(0), pipes, None).unwrap();

        harness.write_line(InstanceId(0), "echo hi").await.unwrap();
        harness.write_line(InstanceId(0), "ifconfig eth0 10.0.2.15").await.unwrap();
        harness.write_control_line(InstanceId(0), "info status").await.unwrap();

        assert_eq!(guest.heard().await, "echo hi\n");
        assert_eq!(guest.heard().await, "ifconfig eth0 10.0.2.15\n");
        assert_eq!(guest.heard_control().await, "info status\n");
    }

    #[tokio::test]
    async fn writes_to_unknown_or_dead_instances_fail() {
        let harness = Harness::new(HarnessConfig::default());
        assert!(matches!(
            harness.write_line(InstanceId(4), "ls").await,
            Err(HarnessError::UnknownInstance { .. })
        ));

        let (pipes, _guest) = duplex_pipes();
        harness.attach(InstanceId(4), pipes, None).unwrap();
        harness.instance(InstanceId(4)).unwrap().kill(KillReason::Watchdog);
        assert!(matches!(
            harness.write_control_line(InstanceId(4), "quit").await,
            Err(HarnessError::InstanceDead { reason: Some(KillReason::Watchdog), .. })
        ));
    }
}
