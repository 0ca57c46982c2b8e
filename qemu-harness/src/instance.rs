use std::{
    fmt,
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::unix::pipe,
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::{
    codec::ConsoleLineCodec,
    error::{HarnessError, Result},
};

/// Index of a supervised guest. Also selects its pipe file names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// The two line-oriented pipe pairs of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Guest serial console.
    Console,
    /// QEMU monitor.
    Control,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Console => f.write_str("console"),
            Self::Control => f.write_str("control"),
        }
    }
}

/// Why an instance was torn down. The first kill wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Shutdown,
    Watchdog,
    ProcessExited,
    LaunchFailed,
    Cleanup,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shut down"),
            Self::Watchdog => f.write_str("killed by watchdog"),
            Self::ProcessExited => f.write_str("launcher exited"),
            Self::LaunchFailed => f.write_str("launch failed"),
            Self::Cleanup => f.write_str("killed by cleanup"),
        }
    }
}

/// Well-known pipe locations for one instance index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    pub console_in: PathBuf,
    pub console_out: PathBuf,
    pub control_in: PathBuf,
    pub control_out: PathBuf,
}

impl PipePaths {
    pub fn new(dir: &Path, id: InstanceId) -> Self {
        Self {
            console_in: dir.join(format!("qemu_serial_pipe{id}.in")),
            console_out: dir.join(format!("qemu_serial_pipe{id}.out")),
            control_in: dir.join(format!("qemu_monitor_pipe{id}.in")),
            control_out: dir.join(format!("qemu_monitor_pipe{id}.out")),
        }
    }

    /// Console pipes first, then control pipes.
    pub fn in_open_order(&self) -> [&Path; 4] {
        [
            &self.console_in,
            &self.console_out,
            &self.control_in,
            &self.control_out,
        ]
    }
}

/// Shared so that an abandoned read leaves any partial line in the frame
/// buffer for the next reader.
pub(crate) type LineSource =
    Arc<tokio::sync::Mutex<FramedRead<Box<dyn AsyncRead + Send + Unpin>, ConsoleLineCodec>>>;
pub(crate) type LineSink = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// The four open pipe handles of a live instance.
///
/// Held as one value so that they are installed and dropped together.
pub struct Pipes {
    console_in: LineSink,
    console_out: LineSource,
    control_in: LineSink,
    control_out: LineSource,
}

impl Pipes {
    pub fn from_streams<CI, CO, MI, MO>(
        console_in: CI,
        console_out: CO,
        control_in: MI,
        control_out: MO,
    ) -> Self
    where
        CI: AsyncWrite + Send + Unpin + 'static,
        CO: AsyncRead + Send + Unpin + 'static,
        MI: AsyncWrite + Send + Unpin + 'static,
        MO: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            console_in: sink(console_in),
            console_out: source(console_out),
            control_in: sink(control_in),
            control_out: source(control_out),
        }
    }

    /// Opens the FIFOs read-write so that neither side blocks on open and a
    /// closing peer never looks like end of stream.
    pub fn open(id: InstanceId, paths: &PipePaths) -> Result<Self> {
        let failed = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| HarnessError::PipeOpen { id, path, source }
        };
        let open_rw = |path: &Path| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(failed(path))
        };
        let console_in = pipe::Sender::from_file(open_rw(&paths.console_in)?)
            .map_err(failed(&paths.console_in))?;
        let console_out = pipe::Receiver::from_file(open_rw(&paths.console_out)?)
            .map_err(failed(&paths.console_out))?;
        let control_in = pipe::Sender::from_file(open_rw(&paths.control_in)?)
            .map_err(failed(&paths.control_in))?;
        let control_out = pipe::Receiver::from_file(open_rw(&paths.control_out)?)
            .map_err(failed(&paths.control_out))?;
        Ok(Self::from_streams(
            console_in,
            console_out,
            control_in,
            control_out,
        ))
    }

    pub(crate) fn source(&self, channel: Channel) -> LineSource {
        match channel {
            Channel::Console => self.console_out.clone(),
            Channel::Control => self.control_out.clone(),
        }
    }

    pub(crate) fn sink(&self, channel: Channel) -> LineSink {
        match channel {
            Channel::Console => self.console_in.clone(),
            Channel::Control => self.control_in.clone(),
        }
    }
}

fn source<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> LineSource {
    let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
    Arc::new(tokio::sync::Mutex::new(FramedRead::new(
        reader,
        ConsoleLineCodec::default(),
    )))
}

fn sink<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> LineSink {
    let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
    Arc::new(tokio::sync::Mutex::new(writer))
}

pub(crate) struct InFlightRead {
    pub(crate) seq: u64,
    pub(crate) token: CancellationToken,
}

pub(crate) struct InstanceState {
    pub(crate) pid: Option<u32>,
    /// `pid` leads its own process group, which is signalled as a whole.
    pub(crate) process_group: bool,
    pub(crate) pipes: Option<Pipes>,
    pub(crate) running: bool,
    pub(crate) killed_by: Option<KillReason>,
    pub(crate) in_flight: Option<InFlightRead>,
    pub(crate) next_read_seq: u64,
    pub(crate) last_line: Option<String>,
}

/// One supervised guest: its process, pipes, and liveness.
///
/// `state` is only ever held for short, non-blocking sections: starting or
/// cancelling a read, tearing down the pipes. Reads wait without it.
pub struct Instance {
    id: InstanceId,
    state: Mutex<InstanceState>,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Instance {
    pub(crate) fn new(id: InstanceId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(InstanceState {
                pid: None,
                process_group: false,
                pipes: None,
                running: true,
                killed_by: None,
                in_flight: None,
                next_read_seq: 0,
                last_line: None,
            }),
            alive: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_state().pid
    }

    pub fn last_line(&self) -> Option<String> {
        self.lock_state().last_line.clone()
    }

    pub fn killed_by(&self) -> Option<KillReason> {
        self.lock_state().killed_by
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn alive_flag(&self) -> &Arc<AtomicBool> {
        &self.alive
    }

    /// Clears the liveness flag, returning whether it was set.
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Cancelled exactly once, when the instance is killed.
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.lock_state().pid = pid;
    }

    /// Records a launcher spawned as the leader of a new process group.
    pub(crate) fn set_group_leader(&self, pid: Option<u32>) {
        let mut state = self.lock_state();
        state.pid = pid;
        state.process_group = pid.is_some();
    }

    pub(crate) fn dead_error(&self) -> HarnessError {
        dead(self.id, &self.lock_state())
    }

    pub(crate) fn install_pipes(&self, pipes: Pipes) -> Result<()> {
        let mut state = self.lock_state();
        if !state.running {
            return Err(dead(self.id, &state));
        }
        state.pipes = Some(pipes);
        Ok(())
    }
}

pub(crate) fn dead(id: InstanceId, state: &InstanceState) -> HarnessError {
    HarnessError::InstanceDead {
        id,
        reason: state.killed_by,
        last_line: state.last_line.clone(),
    }
}
