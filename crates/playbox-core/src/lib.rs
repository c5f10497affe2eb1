//! Playbox Core - shared types for the playground sandbox backend
//!
//! This crate provides:
//! - The wire types exchanged between the playground frontend and the
//!   sandbox execution backend
//! - The replay codec that turns faked-time program output into a
//!   time-ordered event stream

pub mod replay;
pub mod types;

pub use replay::{decode_events, DecodeError, Event, EventKind, Recorder};
pub use types::{ProcessMeta, RunResponse};
