//! The per-stream state machine contract.
//!
//! A command is a [`Machine`]: booted once from the open frame's
//! handshake bytes, stepped on every following stream frame, closed
//! when the peer asks, released once the peer acknowledges. Machines
//! keep their state as explicit tagged enums and pick the next state
//! by assignment inside `step`; the stream table tracks the slot
//! lifecycle around them.

use std::io;

use async_trait::async_trait;

use crate::{
    fetch::LimitedReader,
    frame::{StreamError, StreamHeader},
};

/// A failed machine bootup: the numeric code for the reply frame plus
/// a human-readable message for the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FsmError {
    code: StreamError,
    message: String,
}

impl FsmError {
    /// Wraps an error with the stream error code reported to the peer.
    pub fn new(e: impl core::fmt::Display, code: StreamError) -> Self {
        Self {
            code,
            message: e.to_string(),
        }
    }

    /// The code carried in the failure reply.
    pub fn code(&self) -> StreamError {
        self.code
    }

    /// The log message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl core::fmt::Display for FsmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.message, self.code.0)
    }
}

/// A per-stream command state machine.
///
/// All methods run on the session's inbound task. `step` must fully
/// consume its reader or leave the remainder for the table to ditch;
/// it must never write through the pause-gated sender path, because
/// the inbound task may be holding the pause.
#[async_trait]
pub trait Machine: Send {
    /// Boots the machine from the open frame's handshake bytes.
    ///
    /// On success the stream is running and subsequent frames arrive
    /// via `step`.
    async fn bootup(&mut self, r: &mut LimitedReader<'_>) -> Result<(), FsmError>;

    /// Handles one stream frame.
    async fn step(
        &mut self,
        r: &mut LimitedReader<'_>,
        header: StreamHeader,
    ) -> io::Result<()>;

    /// Stops the machine and gets it ready for release.
    ///
    /// `close` drains the machine's backend tasks before returning, so
    /// no write for this stream can land afterwards. The backend task
    /// is responsible for signalling `Close` toward the peer on its
    /// way out.
    async fn close(&mut self) -> io::Result<()>;

    /// Releases the machine's remaining resources.
    async fn release(&mut self) -> io::Result<()>;
}
