//! Test steps for a booted Linux guest, composed from the line operations.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    error::{HarnessError, Result},
    harness::Harness,
    instance::InstanceId,
};

static PANIC_DURING_INIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[ *[0-9]*\.[0-9]*\] Kernel panic - not syncing").expect("valid panic pattern")
});
static ANY_PANIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[.*\] Kernel panic").expect("valid panic pattern"));
static POWER_DOWN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[ *[0-9]*\.[0-9]*\] Power down\.").expect("valid power down pattern")
});
static PING_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"packets transmitted").expect("valid ping pattern"));
static PING_CLEAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"packets transmitted.*, 0%.packet loss").expect("valid ping pattern")
});

impl Harness {
    /// Reads until the configured init marker. A kernel panic on the way
    /// fails with `UnexpectedTermination`.
    pub async fn wait_for_init(&self, id: InstanceId) -> Result<()> {
        let init = Regex::new(&self.config().init_pattern).map_err(|err| {
            HarnessError::ProtocolViolation {
                id,
                detail: format!("bad init pattern: {err}"),
            }
        })?;
        loop {
            let line = self.next_line(id).await?;
            if init.is_match(&line) {
                info!(instance = %id, "guest init running");
                return Ok(());
            }
            if PANIC_DURING_INIT.is_match(&line) {
                warn!(instance = %id, %line, "kernel panic during init");
                return Err(HarnessError::UnexpectedTermination { id, line });
            }
        }
    }

    /// Reads until the kernel's power-down message. Any kernel panic first
    /// means the shutdown was not clean.
    pub async fn expect_power_down(&self, id: InstanceId) -> Result<()> {
        loop {
            let line = self.next_line(id).await?;
            if POWER_DOWN.is_match(&line) {
                info!(instance = %id, "guest powered down");
                return Ok(());
            }
            if ANY_PANIC.is_match(&line) {
                return Err(HarnessError::UnexpectedTermination { id, line });
            }
            debug!(instance = %id, %line, "waiting for power down");
        }
    }

    /// Reads until a line matches `pattern` and returns it.
    pub async fn expect_line(&self, id: InstanceId, pattern: &Regex) -> Result<String> {
        loop {
            let line = self.next_line(id).await?;
            if pattern.is_match(&line) {
                return Ok(line);
            }
        }
    }

    /// Sends `command` and gives the guest a moment to act on it.
    pub async fn execute(&self, id: InstanceId, command: &str) -> Result<()> {
        self.write_line(id, command).await?;
        tokio::time::sleep(self.config().settle_delay()).await;
        Ok(())
    }

    pub async fn set_ip(&self, id: InstanceId, ip: &str) -> Result<()> {
        self.write_line(id, &format!("ifconfig eth0 {ip}")).await
    }

    /// Pings `to_ip` from instance `from` and requires zero packet loss.
    pub async fn ping(&self, from: InstanceId, to_ip: &str, count: u32) -> Result<()> {
        self.write_line(from, &format!("ping -c {count} -s 5000 {to_ip}"))
            .await?;
        let summary = self.expect_line(from, &PING_SUMMARY).await?;
        info!(instance = %from, %summary, "ping finished");
        if PING_CLEAN.is_match(&summary) {
            Ok(())
        } else {
            Err(HarnessError::ExpectationFailed {
                id: from,
                message: format!("ping to {to_ip} lost packets"),
                line: Some(summary),
            })
        }
    }

    /// Reads until a line containing `stop_at`, failing if any line before
    /// it (or the stop line itself) contains `text`.
    ///
    /// Both are plain substrings, not patterns. Use [`Harness::expect_line`]
    /// to wait on a regex.
    pub async fn expect_output_excludes(
        &self,
        id: InstanceId,
        text: &str,
        stop_at: &str,
    ) -> Result<()> {
        loop {
            let line = self.next_line(id).await?;
            debug!(instance = %id, %line, "checking output");
            if line.contains(text) {
                return Err(HarnessError::ExpectationFailed {
                    id,
                    message: format!("output contained {text:?}"),
                    line: Some(line),
                });
            }
            if line.contains(stop_at) {
                return Ok(());
            }
        }
    }
}
