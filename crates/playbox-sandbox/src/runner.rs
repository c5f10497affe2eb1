//! The jailed half of the two-mode binary.
//!
//! Runs as pid 1 of a gVisor container with no network. The protocol on
//! stdin is a single line of JSON metadata, a newline, then the raw binary
//! to execute. Readiness is signalled in-band: the start marker is the
//! first thing written to stdout, because the sandbox denies the child any
//! other channel to the supervisor.

use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use playbox_core::ProcessMeta;

use crate::{process, INNER_TIMEOUT_MARGIN, KILL_GRACE, RUN_TIMEOUT, START_MARKER, STDERR_HEADER};

/// Where the received binary lands. The tmpfs is mounted by the outer
/// supervisor; the file is never cleaned up because the container is
/// single-use.
const BINARY_PATH: &str = "/tmpfs/play";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no metadata line on stdin")]
    NoMetadata,
    #[error("bad metadata: {0}")]
    BadMetadata(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Receives a binary over stdin, executes it, and returns the exit code
/// the contained process should exit with.
pub async fn run_contained() -> Result<i32, RunnerError> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(START_MARKER).await?;
    stdout.flush().await?;

    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;
    let (meta, binary) = split_input(&input)?;

    tokio::fs::write(BINARY_PATH, binary).await?;
    tokio::fs::set_permissions(BINARY_PATH, std::fs::Permissions::from_mode(0o755)).await?;

    // Everything the runtime wrote to stderr before this point is noise;
    // the supervisor trims through this marker before responding.
    let mut stderr = tokio::io::stderr();
    stderr.write_all(STDERR_HEADER).await?;
    stderr.flush().await?;

    let mut child = Command::new(BINARY_PATH)
        .args(&meta.args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()?;

    // Slightly ahead of the supervisor's own deadline, so that exactly one
    // of the two reliably fires first.
    let deadline = RUN_TIMEOUT - INNER_TIMEOUT_MARGIN;
    match tokio::time::timeout(deadline, child.wait()).await {
        Ok(status) => Ok(status?.code().unwrap_or(1)),
        Err(_) => {
            let _ = process::stop_child(&mut child, KILL_GRACE).await;
            stderr.write_all(b"timeout running program\n").await?;
            stderr.flush().await?;
            Ok(1)
        }
    }
}

/// Splits the stdin stream into its metadata line and binary payload.
fn split_input(input: &[u8]) -> Result<(ProcessMeta, &[u8]), RunnerError> {
    let newline = input
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(RunnerError::NoMetadata)?;
    let meta = serde_json::from_slice(&input[..newline])?;
    Ok((meta, &input[newline + 1..]))
}
