//! A handle to one pre-warmed jailed child process.

use std::collections::HashSet;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use playbox_core::ProcessMeta;

use crate::limits::{OutputSink, SwitchWriter, TooMuchOutput};
use crate::{process, KILL_GRACE, MAX_OUTPUT_SIZE, START_MARKER};

/// Names of the containers the supervisor currently expects to be alive.
/// A name is present from just before launch until the container is
/// closed; reconciliation classifies running containers absent from this
/// set as leaks.
#[derive(Debug, Clone, Default)]
pub struct WantedSet(Arc<Mutex<HashSet<String>>>);

impl WantedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str) {
        self.lock().insert(name.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One pre-warmed container: a writable stdin to the jailed child, two
/// bounded output sinks, and a supervisor task owning the child process.
///
/// A container is handed to exactly one request and never reused.
/// Dropping it cancels its I/O tasks, stops the child, and removes the
/// name from the wanted set.
#[derive(Debug)]
pub struct Container {
    name: String,
    stdin: Option<ChildStdin>,
    stdout: OutputSink,
    stderr: OutputSink,
    exit: oneshot::Receiver<io::Result<ExitStatus>>,
    cancel: CancellationToken,
    wanted: WantedSet,
}

impl Container {
    /// Spawns `cmd` as a worker and wires up the readiness handshake: the
    /// returned receiver fires once the start marker has appeared on the
    /// child's stdout. The name is added to `wanted` before launch.
    pub fn spawn(
        name: String,
        mut cmd: Command,
        wanted: WantedSet,
    ) -> io::Result<(Self, oneshot::Receiver<()>)> {
        wanted.insert(&name);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                wanted.remove(&name);
                return Err(e);
            }
        };
        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, child_stdout, child_stderr) = match pipes {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                wanted.remove(&name);
                return Err(io::Error::other("child stdio not piped"));
            }
        };

        let stdout = OutputSink::new(MAX_OUTPUT_SIZE);
        let stderr = OutputSink::new(MAX_OUTPUT_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let mut switch = SwitchWriter::new(START_MARKER, ready_tx, stdout.clone());
        let out_task = tokio::spawn(copy_to(child_stdout, cancel.clone(), move |data| {
            switch.write(data)
        }));
        let err_sink = stderr.clone();
        let err_task = tokio::spawn(copy_to(child_stderr, cancel.clone(), move |data| {
            err_sink.write(data)
        }));

        let (exit_tx, exit_rx) = oneshot::channel();
        let sup_cancel = cancel.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => {
                    // The pipes hit EOF once the child is gone; join the
                    // copy tasks so the sinks are complete before the exit
                    // is reported.
                    let _ = out_task.await;
                    let _ = err_task.await;
                    status
                }
                _ = sup_cancel.cancelled() => {
                    process::stop_child(&mut child, KILL_GRACE).await
                }
            };
            let _ = exit_tx.send(status);
        });

        Ok((
            Self {
                name,
                stdin: Some(stdin),
                stdout,
                stderr,
                exit: exit_rx,
                cancel,
                wanted,
            },
            ready_rx,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes the metadata line followed by the binary to the jailed
    /// child's stdin, then closes it. Closing is what tells the jail the
    /// binary is complete, so this can be called at most once.
    pub async fn send_program(&mut self, meta: &ProcessMeta, binary: &[u8]) -> io::Result<()> {
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("program already sent"))?;
        let mut line = serde_json::to_vec(meta).map_err(io::Error::other)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.write_all(binary).await?;
        stdin.shutdown().await?;
        Ok(())
    }

    /// Waits for the child to exit and returns the program's exit code.
    pub async fn wait_exit(&mut self) -> io::Result<i32> {
        match (&mut self.exit).await {
            Ok(Ok(status)) => Ok(status.code().unwrap_or(1)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::other("container supervisor went away")),
        }
    }

    pub fn stdout(&self) -> &OutputSink {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputSink {
        &self.stderr
    }

    /// Whether either captured stream exceeded its cap.
    pub fn output_overflowed(&self) -> bool {
        self.stdout.overflowed() || self.stderr.overflowed()
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.wanted.remove(&self.name);
    }
}

/// Pumps a child pipe into `write` until EOF, cancellation, or the sink
/// reports overflow. Once the cap is hit we stop draining; the jail's own
/// deadline bounds a child blocked on a full pipe.
async fn copy_to<R, F>(mut reader: R, cancel: CancellationToken, mut write: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Result<(), TooMuchOutput>,
{
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            res = reader.read(&mut buf) => match res {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
        };
        if write(&buf[..n]).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[tokio::test]
    async fn lifecycle_of_a_cooperative_child() {
        let wanted = WantedSet::new();
        let cmd = shell("echo golang-gvisor-process-started; cat >/dev/null; echo done; exit 7");
        let (mut c, ready) = Container::spawn("play_run_t1".into(), cmd, wanted.clone()).unwrap();
        assert!(wanted.contains("play_run_t1"));

        tokio::time::timeout(Duration::from_secs(5), ready)
            .await
            .unwrap()
            .unwrap();

        c.send_program(&ProcessMeta::default(), b"not a real binary")
            .await
            .unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), c.wait_exit())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 7);
        assert_eq!(c.stdout().take_bytes(), b"done\n");

        drop(c);
        assert!(!wanted.contains("play_run_t1"));
    }

    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let wanted = WantedSet::new();
        let cmd = shell("echo golang-gvisor-process-started; cat >/dev/null; echo oops >&2");
        let (mut c, ready) = Container::spawn("play_run_t2".into(), cmd, wanted).unwrap();
        tokio::time::timeout(Duration::from_secs(5), ready)
            .await
            .unwrap()
            .unwrap();
        c.send_program(&ProcessMeta::default(), b"").await.unwrap();
        let code = c.wait_exit().await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(c.stderr().take_bytes(), b"oops\n");
        assert!(c.stdout().take_bytes().is_empty());
    }

    #[tokio::test]
    async fn program_can_only_be_sent_once() {
        let wanted = WantedSet::new();
        let cmd = shell("echo golang-gvisor-process-started; cat >/dev/null");
        let (mut c, _ready) = Container::spawn("play_run_t3".into(), cmd, wanted).unwrap();
        c.send_program(&ProcessMeta::default(), b"x").await.unwrap();
        assert!(c
            .send_program(&ProcessMeta::default(), b"y")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn a_hung_child_outlives_the_run_clock() {
        let wanted = WantedSet::new();
        let cmd = shell("echo golang-gvisor-process-started; cat >/dev/null; sleep 30");
        let (mut c, ready) = Container::spawn("play_run_t5".into(), cmd, wanted).unwrap();
        tokio::time::timeout(Duration::from_secs(5), ready)
            .await
            .unwrap()
            .unwrap();
        c.send_program(&ProcessMeta::default(), b"x").await.unwrap();
        // The child is still running when the run clock fires; the
        // dispatcher answers with the timeout error and drops the
        // container, which stops the child.
        let waited = tokio::time::timeout(Duration::from_millis(200), c.wait_exit()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn dropping_removes_the_name_immediately() {
        let wanted = WantedSet::new();
        let (c, _ready) = Container::spawn("play_run_t4".into(), shell("sleep 30"), wanted.clone())
            .unwrap();
        assert_eq!(wanted.len(), 1);
        drop(c);
        assert!(wanted.is_empty());
    }
}
