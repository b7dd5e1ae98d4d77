//! VibeTunnel core: PTY sessions, asciicast log, headless terminal state engine,
//! live output distribution (SSE + binary WS), HQ/remote federation. No HTTP surface —
//! that is wired up by the `server` crate.

pub mod activity;
pub mod asciicast;
pub mod buffer;
pub mod config;
pub mod error;
pub mod keys;
pub mod pty;
pub mod remote;
pub mod session;
pub mod stream;
pub mod terminal;

pub use error::{Error, Result};
