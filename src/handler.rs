//! The per-session top-level demux loop.
//!
//! Exactly one inbound task per session runs [`Session::handle`]: it
//! owns the fetch reader over decrypted application frames and the
//! stream table, and dispatches Control, Stream, Close and Completed
//! headers. Stream machine calls all execute on this task; backend
//! tasks only ever touch the shared sender.
//!
//! While the client holds the sender paused, this task must not block
//! on the pause it is itself administering: echoes take the direct
//! write path, and open/close/release run under a scoped resume that
//! re-pauses afterwards. Machines drain their backend tasks inside
//! close, so the re-pause happens only once every write for the stream
//! has landed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::{
    command::{CommandConfig, CommandSet},
    error::ProtocolError,
    fetch::FetchReader,
    frame::{
        Header, HeaderKind, CONTROL_ECHO, CONTROL_PAUSE_STREAM, CONTROL_RESUME_STREAM,
    },
    sender::SharedSender,
    spec::HEADER_DATA_MAX,
    streams::StreamTable,
    transport::FrameWrite,
};

const CONTROL_BUF_LEN: usize = HEADER_DATA_MAX as usize + 3;

/// One client session: the demux loop and everything it owns.
pub struct Session {
    receiver: FetchReader,
    sender: SharedSender,
    streams: StreamTable,
    commands: Arc<CommandSet>,
    command_cfg: CommandConfig,
    read_timeout: Duration,
    receive_delay: Duration,
    send_delay: Duration,
    sender_paused: bool,
}

impl Session {
    /// Assembles a session over a decrypted frame source and a sealing
    /// writer.
    ///
    /// `read_timeout` bounds the idle wait for the next inbound frame;
    /// the browser's heartbeat echoes are expected to keep it from
    /// firing. Zero disables it.
    pub fn new(
        receiver: FetchReader,
        writer: Box<dyn FrameWrite>,
        commands: Arc<CommandSet>,
        command_cfg: CommandConfig,
        read_timeout: Duration,
        receive_delay: Duration,
        send_delay: Duration,
    ) -> Self {
        Self {
            receiver,
            sender: SharedSender::new(writer),
            streams: StreamTable::new(),
            commands,
            command_cfg,
            read_timeout,
            receive_delay,
            send_delay,
            sender_paused: false,
        }
    }

    /// The session's shared sender.
    pub fn sender(&self) -> SharedSender {
        self.sender.clone()
    }

    /// The lifecycle phase of stream `id`.
    pub fn stream_phase(&self, id: u8) -> crate::StreamPhase {
        self.streams.phase(id)
    }

    /// Runs the session until the transport closes or a fatal error
    /// occurs, then shuts every running stream down.
    pub async fn handle(&mut self) -> io::Result<()> {
        let result = self.serve().await;

        if self.sender_paused {
            self.sender.resume();
            self.sender_paused = false;
        }
        self.streams.shutdown().await;

        result
    }

    async fn serve(&mut self) -> io::Result<()> {
        loop {
            if !self.receive_delay.is_zero() {
                sleep(self.receive_delay).await;
            }

            let b = if self.read_timeout.is_zero() {
                self.receiver.fetch_one_byte().await?
            } else {
                match tokio::time::timeout(self.read_timeout, self.receiver.fetch_one_byte())
                    .await
                {
                    Ok(fetched) => fetched?,
                    Err(_) => return Err(io::ErrorKind::TimedOut.into()),
                }
            };

            let header = Header::from_byte(b);
            debug!(%header, "received");

            match header.kind() {
                HeaderKind::Control => self.handle_control(header.data()).await?,
                HeaderKind::Stream => self.handle_stream(header).await?,
                HeaderKind::Close => self.handle_close(header).await?,
                HeaderKind::Completed => self.handle_completed(header).await?,
            }
        }
    }

    async fn handle_control(&mut self, len: u8) -> io::Result<()> {
        let mut buf = [0u8; CONTROL_BUF_LEN];
        let len = usize::from(len);
        if len > buf.len() - 1 {
            return Err(ProtocolError::ControlMessageTooLong.into());
        }
        if len == 0 {
            return Err(ProtocolError::InvalidControlMessage.into());
        }

        self.receiver.read_exact(&mut buf[1..=len]).await?;

        match buf[1] {
            CONTROL_ECHO => {
                debug!(bytes = len, "echo");
                buf[0] = Header::new(HeaderKind::Control, len as u8)?.to_byte();

                // The pause is held by this very task; waiting on it
                // would deadlock.
                if self.sender_paused {
                    self.sender.write_direct(&buf[..=len]).await
                } else {
                    self.sender.write(&buf[..=len]).await
                }
            }

            CONTROL_PAUSE_STREAM => {
                if self.sender_paused {
                    debug!("repeated pause stream command, ignored");
                } else {
                    self.sender.pause();
                    self.sender_paused = true;
                    debug!("pause stream");
                }
                Ok(())
            }

            CONTROL_RESUME_STREAM => {
                if self.sender_paused {
                    self.sender.resume();
                    self.sender_paused = false;
                    debug!("resume stream");
                } else {
                    debug!("repeated resume stream command, ignored");
                }
                Ok(())
            }

            sub => {
                debug!(sub, "unknown control message, ignored");
                Ok(())
            }
        }
    }

    async fn handle_stream(&mut self, header: Header) -> io::Result<()> {
        let id = header.data();

        // A running stream is ticked in place. The machine must not
        // write through the pause-gated path; only this task could
        // release that pause, and it is busy ticking.
        if self.streams.running(id) {
            debug!(stream = id, "ticking stream");
            return self.streams.tick(id, &mut self.receiver).await;
        }

        debug!(stream = id, "start stream");
        let was_paused = self.sender_paused;
        if was_paused {
            self.sender.resume();
        }

        let result = self
            .streams
            .open(
                header,
                &mut self.receiver,
                &self.sender,
                &self.commands,
                &self.command_cfg,
                self.send_delay,
            )
            .await;

        if was_paused {
            self.sender.pause();
        }
        result
    }

    async fn handle_close(&mut self, header: Header) -> io::Result<()> {
        let id = header.data();

        let was_paused = self.sender_paused;
        if was_paused {
            self.sender.resume();
        }

        let result = match self.streams.close(id).await {
            Ok(()) => {
                let completed = Header::new(HeaderKind::Completed, id)?;
                self.sender.signal(completed, &[]).await
            }
            Err(e) => Err(e),
        };

        if was_paused {
            self.sender.pause();
        }
        result
    }

    async fn handle_completed(&mut self, header: Header) -> io::Result<()> {
        let was_paused = self.sender_paused;
        if was_paused {
            self.sender.resume();
        }

        let result = self.streams.release(header.data()).await;

        if was_paused {
            self.sender.pause();
        }
        result
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("streams", &self.streams)
            .field("paused", &self.sender_paused)
            .finish()
    }
}
