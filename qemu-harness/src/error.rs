use std::{io, path::PathBuf, time::Duration};

use crate::instance::{Channel, InstanceId, KillReason};

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Everything a harness operation can fail with.
///
/// All of these are fatal to the calling test step; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(
        "instance {id} is not running ({}; last line: {})",
        reason.map(|r| r.to_string()).unwrap_or_else(|| "pipes not open yet".to_string()),
        shown(last_line)
    )]
    InstanceDead {
        id: InstanceId,
        reason: Option<KillReason>,
        last_line: Option<String>,
    },

    #[error("instance {id}: read cancelled by kill (last line: {})", shown(last_line))]
    ReadCancelled {
        id: InstanceId,
        last_line: Option<String>,
    },

    #[error("instance {id}: another read is already in flight")]
    ReadInFlight { id: InstanceId },

    #[error("instance {id}: {} never appeared after {waited:?}", path.display())]
    LaunchTimeout {
        id: InstanceId,
        path: PathBuf,
        waited: Duration,
    },

    #[error("instance {id}: protocol violation: {detail}")]
    ProtocolViolation { id: InstanceId, detail: String },

    #[error("instance {id}: guest failed: {line}")]
    UnexpectedTermination { id: InstanceId, line: String },

    #[error("instance {id}: {message} (line: {})", shown(line))]
    ExpectationFailed {
        id: InstanceId,
        message: String,
        line: Option<String>,
    },

    #[error("instance {id} is already registered")]
    InstanceExists { id: InstanceId },

    #[error("instance {id} is not registered")]
    UnknownInstance { id: InstanceId },

    #[error("launcher {program:?} not found")]
    LauncherNotFound {
        program: PathBuf,
        #[source]
        source: which::Error,
    },

    #[error("instance {id}: failed to open {}", path.display())]
    PipeOpen {
        id: InstanceId,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unbalanced quoting in launch arguments: {args:?}")]
    InvalidArguments { args: String },

    #[error("instance {id}: failed to spawn launcher")]
    Spawn {
        id: InstanceId,
        #[source]
        source: io::Error,
    },

    #[error("instance {id}: i/o error on {channel} pipe")]
    Io {
        id: InstanceId,
        channel: Channel,
        #[source]
        source: io::Error,
    },
}

impl HarnessError {
    /// The instance this error is about, if any.
    pub fn instance(&self) -> Option<InstanceId> {
        match self {
            Self::InstanceDead { id, .. }
            | Self::ReadCancelled { id, .. }
            | Self::ReadInFlight { id }
            | Self::LaunchTimeout { id, .. }
            | Self::ProtocolViolation { id, .. }
            | Self::UnexpectedTermination { id, .. }
            | Self::ExpectationFailed { id, .. }
            | Self::InstanceExists { id }
            | Self::UnknownInstance { id }
            | Self::PipeOpen { id, .. }
            | Self::Spawn { id, .. }
            | Self::Io { id, .. } => Some(*id),
            Self::LauncherNotFound { .. } | Self::InvalidArguments { .. } => None,
        }
    }
}

fn shown(line: &Option<String>) -> &str {
    line.as_deref().unwrap_or("<none>")
}
