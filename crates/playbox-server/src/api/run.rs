//! POST /run, the sole execution-surface endpoint.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method};
use axum::Json;
use tracing::{debug, error};

use playbox_core::{ProcessMeta, RunResponse};
use playbox_sandbox::{Container, TooMuchOutput, MAX_BINARY_SIZE, RUN_TIMEOUT, STDERR_HEADER};

use crate::api::error::ApiError;
use crate::state::AppState;

pub const RUN_TIMEOUT_ERROR: &str = "timeout running program";

/// Strings in program stderr that mean the sandbox itself, not the user
/// program, ran out of resources. Flagged for operators because they are
/// non-deterministic and should never be treated as user output.
const INTERNAL_ERRORS: [&str; 2] = ["out of memory", "cannot allocate memory"];

/// Upper bound on waiting for a ready container: in the worst case every
/// worker is mid-request and mid-restart.
const ACQUIRE_DEADLINE: Duration =
    Duration::from_secs(playbox_sandbox::START_TIMEOUT.as_secs() + RUN_TIMEOUT.as_secs());

/// Runs the binary in the request body inside a pooled container and
/// responds with its exit code and captured streams. User-surfacable
/// failures (timeout, oversized output) ride the `error` field of a 200;
/// only infrastructure failures produce a 5xx.
pub async fn run(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<RunResponse>, ApiError> {
    if req.method() != Method::POST {
        return Err(ApiError::BadRequest("expected a POST request".into()));
    }

    // Admission is bounded before the body is read, so queued requests
    // are not holding 100 MiB binaries in memory.
    let _permit = state
        .pool
        .admission()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::Internal("server is shutting down".into()))?;

    let args = arguments(req.headers());
    let body = axum::body::to_bytes(req.into_body(), MAX_BINARY_SIZE)
        .await
        .map_err(|e| {
            error!(error = %e, "reading request binary failed");
            ApiError::Internal("binary too large or unreadable".into())
        })?;

    let mut container = state.pool.acquire(ACQUIRE_DEADLINE).await.map_err(|e| {
        error!(error = %e, "acquiring container failed");
        ApiError::Internal("sandbox not available".into())
    })?;
    debug!(container = container.name(), binary_bytes = body.len(), "dispatching run");

    // The run clock is independent of the HTTP context, so a timeout is
    // classified the same way whether or not the client is still there.
    let meta = ProcessMeta { args };
    let outcome = tokio::select! {
        _ = tokio::time::sleep(RUN_TIMEOUT) => None,
        res = async {
            container.send_program(&meta, &body).await?;
            container.wait_exit().await
        } => Some(res),
    };

    let resp = match outcome {
        None => RunResponse::failure(RUN_TIMEOUT_ERROR),
        Some(Ok(exit_code)) => collect_response(&container, exit_code),
        Some(Err(e)) => {
            error!(container = container.name(), error = %e, "running binary failed");
            return Err(ApiError::Internal("error running sandbox".into()));
        }
    };
    drop(container);

    if let Some(marker) = internal_error_marker(&resp.stderr) {
        error!(marker, "sandbox resource failure surfaced in program output");
    }

    Ok(Json(resp))
}

fn internal_error_marker(stderr: &[u8]) -> Option<&'static str> {
    let text = String::from_utf8_lossy(stderr);
    INTERNAL_ERRORS.iter().find(|m| text.contains(*m)).copied()
}

/// Assembles the normal-completion response. Truncated output is never
/// returned: if either stream overflowed its cap the whole response is
/// the oversize error.
fn collect_response(container: &Container, exit_code: i32) -> RunResponse {
    if container.output_overflowed() {
        return RunResponse::failure(TooMuchOutput.to_string());
    }
    RunResponse {
        error: None,
        exit_code,
        stdout: container.stdout().take_bytes(),
        stderr: trim_stderr(container.stderr().take_bytes()),
    }
}

/// Strips everything through the stderr header marker, removing the
/// container-runtime noise that appears before user output starts.
fn trim_stderr(stderr: Vec<u8>) -> Vec<u8> {
    match stderr
        .windows(STDERR_HEADER.len())
        .position(|w| w == STDERR_HEADER)
    {
        Some(pos) => stderr[pos + STDERR_HEADER.len()..].to_vec(),
        None => stderr,
    }
}

/// Repeatable `X-Argument` headers become the child's argv tail, in
/// header order.
fn arguments(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("X-Argument")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(String::from)
        .collect()
}
