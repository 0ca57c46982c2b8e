//! Cancellable line reads.
//!
//! Each read runs as its own task against one pipe. The caller registers the
//! task's cancellation token under the instance lock, then waits for the task
//! with the lock released, so [`Instance::kill`] can always get in and cancel
//! it. A read that finishes without a line was cancelled.

use std::sync::{atomic::Ordering, Arc, LazyLock};

use futures_util::StreamExt;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    error::{HarnessError, Result},
    harness::Harness,
    instance::{dead, Channel, InFlightRead, Instance, InstanceId, LineSource},
};

/// Kernel log lines: `[    1.234567] ...`.
pub static KERNEL_LOG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[ *[0-9]*\.[0-9]*\] ").expect("valid kernel log pattern"));

/// Clears the in-flight slot when the waiting caller goes away, including
/// when its future is dropped mid-read.
struct InFlightGuard<'a> {
    instance: &'a Instance,
    seq: u64,
    token: CancellationToken,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.token.cancel();
        let mut state = self.instance.lock_state();
        if state.in_flight.as_ref().is_some_and(|read| read.seq == self.seq) {
            state.in_flight = None;
        }
    }
}

impl Instance {
    /// Reads exactly one line from `channel`, without its terminator.
    pub async fn read_line(&self, channel: Channel) -> Result<String> {
        let (task, guard) = {
            let mut state = self.lock_state();
            if !state.running {
                return Err(dead(self.id(), &state));
            }
            if state.in_flight.is_some() {
                return Err(HarnessError::ReadInFlight { id: self.id() });
            }
            let Some(pipes) = state.pipes.as_ref() else {
                return Err(dead(self.id(), &state));
            };
            let source = pipes.source(channel);

            let seq = state.next_read_seq;
            state.next_read_seq += 1;
            let token = self.shutdown_token().child_token();
            state.in_flight = Some(InFlightRead {
                seq,
                token: token.clone(),
            });

            let task = tokio::spawn(read_one(source, token.clone(), self.alive_flag().clone()));
            let guard = InFlightGuard {
                instance: self,
                seq,
                token,
            };
            (task, guard)
        };

        let outcome = task.await;
        drop(guard);

        match outcome {
            Ok(Ok(Some(line))) => {
                trace!(instance = %self.id(), %channel, %line, "read");
                self.lock_state().last_line = Some(line.clone());
                Ok(line)
            }
            Ok(Err(source)) => Err(HarnessError::Io {
                id: self.id(),
                channel,
                source,
            }),
            Ok(Ok(None)) | Err(_) => Err(HarnessError::ReadCancelled {
                id: self.id(),
                last_line: self.last_line(),
            }),
        }
    }
}

/// Body of one read task. `None` means the token fired first.
async fn read_one(
    source: LineSource,
    token: CancellationToken,
    alive: Arc<std::sync::atomic::AtomicBool>,
) -> std::io::Result<Option<String>> {
    // Cancellation first: a cancelled read must never consume a line. Bytes
    // of a partial line stay buffered in the shared source.
    let next = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(None),
        next = async { source.lock().await.next().await } => next,
    };
    let Some(line) = next else {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    };
    let line = line?;
    alive.store(true, Ordering::Release);
    Ok(Some(line))
}

impl Harness {
    /// Blocks until instance `id` prints a console line or is killed.
    ///
    /// There is no timeout of its own: the watchdog is what ends a read on a
    /// silent guest.
    pub async fn next_line(&self, id: InstanceId) -> Result<String> {
        self.instance(id)?.read_line(Channel::Console).await
    }

    pub async fn next_control_line(&self, id: InstanceId) -> Result<String> {
        self.instance(id)?.read_line(Channel::Control).await
    }

    /// Like [`Harness::next_line`], discarding lines that match `pattern`.
    pub async fn next_line_skipping(&self, id: InstanceId, pattern: &Regex) -> Result<String> {
        loop {
            let line = self.next_line(id).await?;
            if !pattern.is_match(&line) {
                return Ok(line);
            }
            trace!(instance = %id, %line, "skipped");
        }
    }

    /// Next console line that is not kernel log output.
    pub async fn next_non_log_line(&self, id: InstanceId) -> Result<String> {
        self.next_line_skipping(id, &KERNEL_LOG_PATTERN).await
    }
}
