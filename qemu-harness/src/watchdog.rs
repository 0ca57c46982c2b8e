//! Per-instance liveness timer.
//!
//! Every `interval` the watchdog consumes the instance's liveness flag. A
//! window in which no line was read kills the instance. A guest that is
//! merely slow to print is indistinguishable from a hung one here; tests
//! that expect long silences need a longer interval.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::instance::{Instance, KillReason};

pub(crate) fn spawn(instance: Arc<Instance>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = instance.shutdown_token().clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if !instance.take_alive() {
                warn!(
                    instance = %instance.id(),
                    ?interval,
                    last_line = instance.last_line().as_deref().unwrap_or("<none>"),
                    "no output within watchdog interval"
                );
                instance.kill(KillReason::Watchdog);
                break;
            }
        }
        debug!(instance = %instance.id(), "watchdog stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::HarnessConfig, error::HarnessError, harness::Harness, instance::InstanceId,
        test_support::duplex_pipes,
    };
    use pretty_assertions::assert_eq;

    fn quick_watchdog() -> Harness {
        Harness::new(HarnessConfig {
            watchdog_interval_ms: 100,
            ..HarnessConfig::default()
        })
    }

    #[tokio::test]
    async fn silent_instance_is_killed() {
        let harness = quick_watchdog();
        let (pipes, _guest) = duplex_pipes();
        harness.attach(InstanceId(0), pipes, None).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let instance = harness.instance(InstanceId(0)).unwrap();
        assert_eq!(instance.killed_by(), Some(KillReason::Watchdog));
        assert!(matches!(
            harness.next_line(InstanceId(0)).await,
            Err(HarnessError::InstanceDead { reason: Some(KillReason::Watchdog), .. })
        ));
    }

    #[tokio::test]
    async fn steady_output_keeps_instance_alive() {
        let harness = quick_watchdog();
        let (pipes, mut guest) = duplex_pipes();
        harness.attach(InstanceId(0), pipes, None).unwrap();

        for n in 0..10 {
            guest.say(&format!("tick {n}")).await;
            assert_eq!(harness.next_line(InstanceId(0)).await.unwrap(), format!("tick {n}"));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert!(harness.is_running(InstanceId(0)));
    }

    #[tokio::test]
    async fn watchdog_exits_when_instance_is_killed() {
        let instance = Instance::new(InstanceId(0));
        let handle = spawn(instance.clone(), Duration::from_secs(3600));
        instance.kill(KillReason::Shutdown);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watchdog should stop on kill")
            .unwrap();
        assert_eq!(instance.killed_by(), Some(KillReason::Shutdown));
    }
}
