//! Replay codec for faked-time program output.
//!
//! Playground programs run with a faked clock and precede each of their
//! writes with a playback header describing when the write occurred (in
//! playground time) and the length of the data that follows:
//!
//! ```text
//! 4 bytes: "\x00\x00PB", a magic header
//! 8 bytes: big-endian i64, unix time in nanoseconds
//! 4 bytes: big-endian i32, length of the next write
//! ```
//!
//! The decoder turns the captured stdout/stderr byte streams into a single
//! time-ordered sequence of [`Event`]s. If a non-header is encountered
//! where a header is expected, the output is scanned for the next header
//! and the intervening bytes are attributed to the time of the preceding
//! frame (or the epoch if there was none), so programs that write raw,
//! unframed output still replay.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// When sandbox time begins, in unix nanoseconds.
const EPOCH_NANOS: i64 = 1_257_894_000 * 1_000_000_000;

const MAGIC: &[u8] = b"\x00\x00PB";
const HEADER_LEN: usize = 8 + 4;

/// Structural errors in a framed output stream. Any of these fails the
/// whole decode; no partial event sequence is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("short header")]
    ShortHeader,
    #[error("bad length: {0}")]
    BadLength(i32),
}

/// Which standard stream an event was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Stdout,
    Stderr,
}

/// A single displayable chunk of program output.
///
/// The field names are part of the wire contract with the editor/player
/// UI; `delay` is serialized as integer nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub message: String,
    pub kind: EventKind,
    /// Time to wait before showing `message`.
    #[serde(with = "duration_nanos")]
    pub delay: Duration,
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(de)?))
    }
}

/// A decoded frame before merging and delay computation.
struct RawEvent {
    msg: Vec<u8>,
    kind: EventKind,
    nanos: i64,
}

/// Decodes the captured stdout and stderr of a sandbox program into a
/// merged, time-ordered sequence of events. Each event's message is
/// sanitized to valid UTF-8.
pub fn decode_events(stdout: &[u8], stderr: &[u8]) -> Result<Vec<Event>, DecodeError> {
    let ev_out = decode_stream(EventKind::Stdout, stdout)?;
    let ev_err = decode_stream(EventKind::Stderr, stderr)?;

    let merged = sorted_merge(ev_out, ev_err);

    let mut events = Vec::with_capacity(merged.len());
    let mut now = EPOCH_NANOS;
    for e in merged {
        let delay = (e.nanos - now).max(0);
        events.push(Event {
            message: sanitize(e.msg),
            kind: e.kind,
            delay: Duration::from_nanos(delay as u64),
        });
        // Events sharing a tick report zero delay; only a strictly later
        // event advances the clock.
        if delay > 0 {
            now = e.nanos;
        }
    }
    Ok(events)
}

/// Collects the raw stdout/stderr bytes of a sandbox program and converts
/// them to events, for callers that capture the streams incrementally.
#[derive(Debug, Default)]
pub struct Recorder {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    pub fn record_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }

    pub fn events(&self) -> Result<Vec<Event>, DecodeError> {
        decode_events(&self.stdout, &self.stderr)
    }
}

fn decode_stream(kind: EventKind, output: &[u8]) -> Result<Vec<RawEvent>, DecodeError> {
    let mut events: Vec<RawEvent> = Vec::new();
    let mut last = EPOCH_NANOS;

    fn add(events: &mut Vec<RawEvent>, last: &mut i64, kind: EventKind, t: i64, b: &[u8]) {
        match events.last_mut() {
            // Merge with the previous event when the timestamp repeats, to
            // avoid fragmenting a big write with no timing information.
            Some(prev) if prev.nanos == t => prev.msg.extend_from_slice(b),
            _ => events.push(RawEvent {
                msg: b.to_vec(),
                kind,
                nanos: t,
            }),
        }
        *last = t;
    }

    let mut i = 0;
    while i < output.len() {
        if !output[i..].starts_with(MAGIC) {
            // Not a header; find the next one. Anything in between (or the
            // whole tail, if there is none) belongs to the current time.
            match find(&output[i..], MAGIC) {
                None => {
                    let t = last;
                    add(&mut events, &mut last, kind, t, &output[i..]);
                    break;
                }
                Some(j) => {
                    let t = last;
                    add(&mut events, &mut last, kind, t, &output[i..i + j]);
                    i += j;
                }
            }
        }
        i += MAGIC.len();

        if output.len() - i < HEADER_LEN {
            return Err(DecodeError::ShortHeader);
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&output[i..i + 8]);
        // Force timestamps to be monotonic. (This could be an encoding
        // error, which would likely be picked up when decoding the length.)
        let t = i64::from_be_bytes(ts).max(last);

        let mut len = [0u8; 4];
        len.copy_from_slice(&output[i + 8..i + HEADER_LEN]);
        let n = i32::from_be_bytes(len);
        if n < 0 {
            return Err(DecodeError::BadLength(n));
        }
        i += HEADER_LEN;

        // Truncated payloads are OK (probably caused by sandbox limits).
        let end = (i + n as usize).min(output.len());
        add(&mut events, &mut last, kind, t, &output[i..end]);
        i += n as usize;
    }
    Ok(events)
}

/// Sorted merge of the two per-stream sequences into one.
fn sorted_merge(a: Vec<RawEvent>, b: Vec<RawEvent>) -> Vec<RawEvent> {
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }

    let mut sorted = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let take_a = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => x.nanos < y.nanos,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_a { a.next() } else { b.next() };
        if let Some(e) = next {
            sorted.push(e);
        }
    }
    sorted
}

/// Replaces invalid UTF-8 sequences with U+FFFD.
fn sanitize(msg: Vec<u8>) -> String {
    match String::from_utf8(msg) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds one framed record the way the faked-time runtime does.
    fn frame(nanos_after_epoch: i64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAGIC.len() + HEADER_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(EPOCH_NANOS + nanos_after_epoch).to_be_bytes());
        out.extend_from_slice(&(payload.len() as i32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    const SEC: i64 = 1_000_000_000;

    #[test]
    fn interleaved_streams() {
        let stdout = frame(SEC, b"A");
        let stderr = frame(2 * SEC, b"B");
        let events = decode_events(&stdout, &stderr).unwrap();
        assert_eq!(
            events,
            vec![
                Event {
                    message: "A".into(),
                    kind: EventKind::Stdout,
                    delay: Duration::from_secs(1),
                },
                Event {
                    message: "B".into(),
                    kind: EventKind::Stderr,
                    delay: Duration::from_secs(1),
                },
            ]
        );
    }

    #[test]
    fn unframed_output_attributed_to_preceding_frame() {
        let mut stdout = b"before".to_vec();
        stdout.extend_from_slice(&frame(SEC, b"one"));
        stdout.extend_from_slice(b"between");
        stdout.extend_from_slice(&frame(2 * SEC, b"two"));
        stdout.extend_from_slice(b"after");

        let events = decode_events(&stdout, &[]).unwrap();
        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["before", "onebetween", "twoafter"]);
        assert_eq!(events[0].delay, Duration::ZERO);
        assert_eq!(events[1].delay, Duration::from_secs(1));
        assert_eq!(events[2].delay, Duration::from_secs(1));
    }

    #[test]
    fn same_timestamp_writes_merge() {
        let mut stdout = frame(SEC, b"big ");
        stdout.extend_from_slice(&frame(SEC, b"write"));
        let events = decode_events(&stdout, &[]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "big write");
    }

    #[test]
    fn shared_tick_reports_zero_delay() {
        let stdout = frame(SEC, b"out");
        let stderr = frame(SEC, b"err");
        let events = decode_events(&stdout, &stderr).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].delay, Duration::from_secs(1));
        assert_eq!(events[1].delay, Duration::ZERO);
    }

    #[test]
    fn delays_are_cumulative() {
        let mut stdout = frame(SEC, b"a");
        stdout.extend_from_slice(&frame(3 * SEC, b"b"));
        stdout.extend_from_slice(&frame(7 * SEC, b"c"));
        let events = decode_events(&stdout, &[]).unwrap();
        let total: Duration = events.iter().map(|e| e.delay).sum();
        assert_eq!(total, Duration::from_secs(7));
    }

    #[test]
    fn non_monotonic_timestamps_are_clamped() {
        let mut stdout = frame(2 * SEC, b"late");
        stdout.extend_from_slice(&frame(SEC, b"early"));
        let events = decode_events(&stdout, &[]).unwrap();
        // The second frame is pulled forward to the first frame's time and
        // merges with it.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "lateearly");
    }

    #[test]
    fn truncated_payload_is_tolerated() {
        let mut stdout = frame(SEC, b"full payload");
        stdout.truncate(stdout.len() - 8);
        let events = decode_events(&stdout, &[]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "full");
    }

    #[test]
    fn short_header_fails_decode() {
        let mut stdout = frame(SEC, b"x");
        stdout.extend_from_slice(MAGIC);
        stdout.extend_from_slice(&[0, 0, 0]);
        assert_eq!(decode_events(&stdout, &[]), Err(DecodeError::ShortHeader));
    }

    #[test]
    fn negative_length_fails_decode() {
        let mut stdout = MAGIC.to_vec();
        stdout.extend_from_slice(&EPOCH_NANOS.to_be_bytes());
        stdout.extend_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(decode_events(&stdout, &[]), Err(DecodeError::BadLength(-1)));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let stdout = frame(SEC, &[b'h', b'i', 0xff, 0xfe]);
        let events = decode_events(&stdout, &[]).unwrap();
        assert!(events[0].message.starts_with("hi"));
        assert!(events[0].message.contains('\u{FFFD}'));
    }

    #[test]
    fn payload_round_trip_per_stream() {
        let payloads: Vec<&[u8]> = vec![b"one", b"two", b"three"];
        let mut stdout = Vec::new();
        for (i, p) in payloads.iter().enumerate() {
            stdout.extend_from_slice(&frame((i as i64 + 1) * SEC, p));
        }
        let events = decode_events(&stdout, &[]).unwrap();
        let joined: String = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(joined, "onetwothree");
        assert!(events.iter().all(|e| e.kind == EventKind::Stdout));
    }

    #[test]
    fn recorder_accumulates_writes() {
        let mut rec = Recorder::new();
        let stdout = frame(SEC, b"hello");
        rec.record_stdout(&stdout[..6]);
        rec.record_stdout(&stdout[6..]);
        rec.record_stderr(&frame(2 * SEC, b"world"));
        let events = rec.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "hello");
        assert_eq!(events[1].message, "world");
    }

    #[test]
    fn event_wire_format() {
        let ev = Event {
            message: "hi".into(),
            kind: EventKind::Stdout,
            delay: Duration::from_secs(1),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"message": "hi", "kind": "stdout", "delay": 1_000_000_000u64})
        );
    }
}
