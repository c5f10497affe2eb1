//! Output limiters for untrusted program streams.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;

/// Returned once a stream has produced more bytes than its cap. The
/// message is user-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Output too large")]
pub struct TooMuchOutput;

/// An append-only buffer that accepts at most `max` bytes. A write that
/// would exceed the cap keeps the prefix that fits and marks the buffer
/// overflowed; the overflow is sticky and every later write fails.
#[derive(Debug)]
pub struct BoundedWriter {
    buf: Vec<u8>,
    max: usize,
    overflowed: bool,
}

impl BoundedWriter {
    pub fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
            overflowed: false,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), TooMuchOutput> {
        if self.overflowed {
            return Err(TooMuchOutput);
        }
        let room = self.max - self.buf.len();
        if data.len() <= room {
            self.buf.extend_from_slice(data);
            Ok(())
        } else {
            self.buf.extend_from_slice(&data[..room]);
            self.overflowed = true;
            Err(TooMuchOutput)
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Shared handle to a [`BoundedWriter`]. Written by a container's copy
/// task; read by the dispatcher only after the child has exited.
#[derive(Debug, Clone)]
pub struct OutputSink(Arc<Mutex<BoundedWriter>>);

impl OutputSink {
    pub fn new(max: usize) -> Self {
        Self(Arc::new(Mutex::new(BoundedWriter::new(max))))
    }

    pub fn write(&self, data: &[u8]) -> Result<(), TooMuchOutput> {
        self.lock().write(data)
    }

    pub fn overflowed(&self) -> bool {
        self.lock().overflowed()
    }

    pub fn take_bytes(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().buf)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoundedWriter> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bytes retained while scanning for the start marker; enough context to
/// log why a container failed to come up without letting a misbehaving
/// image grow the buffer without bound.
const MAX_PRELUDE: usize = 1 << 20;

/// Routes a child's stdout around the in-band readiness handshake.
///
/// Everything up to and including the start marker is retained as the
/// prelude; once the marker has been seen (even split across writes) the
/// readiness signal fires and all later bytes go to the bounded sink.
pub struct SwitchWriter {
    marker: Vec<u8>,
    prelude: Vec<u8>,
    found: bool,
    ready: Option<oneshot::Sender<()>>,
    dst: OutputSink,
}

impl SwitchWriter {
    pub fn new(marker: impl Into<Vec<u8>>, ready: oneshot::Sender<()>, dst: OutputSink) -> Self {
        Self {
            marker: marker.into(),
            prelude: Vec::new(),
            found: false,
            ready: Some(ready),
            dst,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), TooMuchOutput> {
        if self.found {
            return self.dst.write(data);
        }
        self.prelude.extend_from_slice(data);
        if let Some(pos) = find(&self.prelude, &self.marker) {
            self.found = true;
            let rest = self.prelude.split_off(pos + self.marker.len());
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(());
            }
            if !rest.is_empty() {
                return self.dst.write(&rest);
            }
        } else if self.prelude.len() > MAX_PRELUDE {
            let keep = self.marker.len().saturating_sub(1);
            let cut = self.prelude.len() - keep;
            self.prelude.drain(..cut);
        }
        Ok(())
    }

    pub fn found(&self) -> bool {
        self.found
    }

    /// Bytes seen before the marker (or so far, if it never arrived).
    pub fn prelude(&self) -> &[u8] {
        &self.prelude
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
