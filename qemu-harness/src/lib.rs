//! Supervision of QEMU guests driven over line-oriented pipes.
//!
//! A [`Harness`] boots guests through a launcher script that exposes a serial
//! console and a monitor as named pipe pairs. Test code reads and writes whole
//! lines; a per-instance watchdog kills any guest that goes quiet, and a kill
//! always unblocks a pending read.

mod codec;
pub mod config;
pub mod error;
mod exit_watcher;
mod harness;
pub mod instance;
mod launcher;
mod reader;
pub mod registry;
mod steps;
mod supervisor;
mod watchdog;
mod writer;

#[cfg(test)]
mod test_support;

pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use harness::Harness;
pub use instance::{Channel, Instance, InstanceId, KillReason, PipePaths, Pipes};
pub use reader::KERNEL_LOG_PATTERN;
