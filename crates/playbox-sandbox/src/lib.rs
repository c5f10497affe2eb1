//! Playbox Sandbox - gVisor-isolated execution of untrusted binaries
//!
//! This crate provides:
//! - A pool of pre-warmed Docker containers, each blocked on stdin with
//!   the jailed runner as entrypoint
//! - Bounded output sinks and the switch writer that detects readiness
//! - The jailed runner itself (the `contained` half of the binary)
//! - Leak reconciliation against the container runtime's actual state

pub mod container;
pub mod docker;
pub mod limits;
pub mod pool;
pub mod process;
pub mod runner;

use std::time::Duration;

pub use container::{Container, WantedSet};
pub use limits::{BoundedWriter, OutputSink, SwitchWriter, TooMuchOutput};
pub use pool::{ContainerPool, PoolConfig, PoolError, PoolStats};

/// First bytes the jailed process writes to stdout once it is ready to
/// receive a binary. The supervisor side scans for exactly these bytes, so
/// they are ABI with every deployed sandbox image.
pub const START_MARKER: &[u8] = b"golang-gvisor-process-started\n";

/// Written to the jailed process's stderr after the binary has been
/// received, before the user program runs. Everything on stderr up to and
/// including this marker is container-runtime noise and is stripped from
/// the response.
pub const STDERR_HEADER: &[u8] = b"golang-gvisor-stderr-header\n";

/// Largest accepted user binary.
pub const MAX_BINARY_SIZE: usize = 100 << 20;

/// Cap applied independently to each captured output stream.
pub const MAX_OUTPUT_SIZE: usize = 100 << 20;

/// Memory limit for each worker container.
pub const MEMORY_LIMIT_BYTES: u64 = 100 << 20;

/// Wall-clock budget for one user program, measured by the dispatcher
/// from writing the metadata to child exit.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(5);

/// The jail's own deadline runs this much ahead of [`RUN_TIMEOUT`] so
/// that one of the two reliably fires first.
pub const INNER_TIMEOUT_MARGIN: Duration = Duration::from_millis(500);

/// Budget for a worker container to emit the start marker.
pub const START_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a stopped child gets between SIGINT and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_millis(250);
