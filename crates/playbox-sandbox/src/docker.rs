//! Docker invocation for the gVisor-isolated workers.

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::MEMORY_LIMIT_BYTES;

/// Prefix of every worker container name; reconciliation filters the
/// runtime's listing down to it.
pub const NAME_PREFIX: &str = "play_run_";

/// Image run for each worker. Its entrypoint is this same binary in
/// `--mode=contained`.
pub const DEFAULT_IMAGE: &str = "gcr.io/golang-org/playground-sandbox-gvisor:latest";

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker could not be run: {0}")]
    Io(#[from] std::io::Error),
    #[error("docker {command} failed: {stderr}")]
    Failed {
        command: &'static str,
        stderr: String,
    },
    #[error("malformed container listing: {0}")]
    Listing(#[from] serde_json::Error),
}

/// A fresh `play_run_` name with an 8-hex-nibble random suffix, unique
/// for the life of this process.
pub fn random_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{NAME_PREFIX}{}", &id[..8])
}

/// Command line that launches one worker container: gVisor runtime, no
/// network, a private writable tmpfs, a memory cap, stdin attached, and
/// removal on exit.
pub fn run_command(name: &str, image: &str) -> Command {
    let mut cmd = Command::new("docker");
    cmd.arg("run")
        .arg(format!("--name={name}"))
        .arg("--rm")
        .arg("--tmpfs=/tmpfs:rw,exec")
        .arg("-i")
        .arg("--runtime=runsc")
        .arg("--network=none")
        .arg(format!("--memory={MEMORY_LIMIT_BYTES}"))
        .arg(image)
        .arg("--mode=contained");
    cmd
}

/// One row of `docker ps --format {{json .}}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Names")]
    pub names: String,
}

/// Parses the runtime's listing, one JSON object per line. An empty
/// listing is fine; a malformed line fails the whole poll.
pub fn parse_containers(output: &[u8]) -> Result<Vec<ContainerInfo>, serde_json::Error> {
    let text = String::from_utf8_lossy(output);
    let mut containers = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        containers.push(serde_json::from_str(line)?);
    }
    Ok(containers)
}

/// Lists the currently-running worker containers.
pub async fn list_containers() -> Result<Vec<ContainerInfo>, DockerError> {
    let out = Command::new("docker")
        .args([
            "ps",
            "--filter",
            &format!("name={NAME_PREFIX}"),
            "--format",
            "{{json .}}",
        ])
        .output()
        .await?;
    if !out.status.success() {
        return Err(DockerError::Failed {
            command: "ps",
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        });
    }
    Ok(parse_containers(&out.stdout)?)
}

/// Verifies the docker daemon is reachable.
pub async fn check_daemon() -> Result<(), DockerError> {
    let out = Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .output()
        .await?;
    if !out.status.success() {
        return Err(DockerError::Failed {
            command: "version",
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        });
    }
    debug!(
        version = %String::from_utf8_lossy(&out.stdout).trim(),
        "docker daemon reachable"
    );
    Ok(())
}

/// Makes sure `image` is available locally, pulling it if necessary. A
/// failed pull is tolerated when the image is already present (the
/// registry may be unreachable while a cached image is fine).
pub async fn ensure_image(image: &str) -> Result<(), DockerError> {
    let pull = Command::new("docker").args(["pull", image]).output().await?;
    if pull.status.success() {
        debug!(image, "image pulled");
        return Ok(());
    }
    warn!(
        image,
        stderr = %String::from_utf8_lossy(&pull.stderr).trim(),
        "image pull failed; checking for a local copy"
    );
    let inspect = Command::new("docker")
        .args(["image", "inspect", image])
        .output()
        .await?;
    if inspect.status.success() {
        return Ok(());
    }
    Err(DockerError::Failed {
        command: "pull",
        stderr: String::from_utf8_lossy(&pull.stderr).into_owned(),
    })
}
