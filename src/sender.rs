//! The single writer shared by the session handler and every backend
//! task, with the pause/resume discipline.
//!
//! All outbound application frames funnel through one [`SharedSender`]
//! guarding the sealing writer with an async mutex. A pause flag plus
//! a notifier implement the condition-variable contract: backend tasks
//! block in [`SharedSender::write`] while paused; the inbound task,
//! which may itself hold the pause, uses the direct path or a scoped
//! resume instead. The paused check happens under the writer lock, so
//! a pause can never race a write decision.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;

use crate::{
    error::{Error, ProtocolError},
    frame::{Header, HeaderKind, StreamHeader},
    spec::{STREAM_BODY_MAX_LEN, STREAM_HEADER_SIZE},
    transport::FrameWrite,
};

struct Shared {
    io: tokio::sync::Mutex<Box<dyn FrameWrite>>,
    paused: Mutex<bool>,
    resumed: Notify,
}

/// The pause-aware shared writer.
#[derive(Clone)]
pub struct SharedSender {
    inner: Arc<Shared>,
}

impl SharedSender {
    /// Wraps `writer` as the session's single outbound path.
    pub fn new(writer: Box<dyn FrameWrite>) -> Self {
        Self {
            inner: Arc::new(Shared {
                io: tokio::sync::Mutex::new(writer),
                paused: Mutex::new(false),
                resumed: Notify::new(),
            }),
        }
    }

    /// Writes one application frame, waiting while the sender is
    /// paused.
    ///
    /// This is the only path backend tasks may use.
    pub async fn write(&self, b: &[u8]) -> io::Result<()> {
        loop {
            let notified = self.inner.resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut io = self.inner.io.lock().await;
                if !*self.inner.paused.lock().unwrap() {
                    return io.write_frame(b).await;
                }
            }
            notified.await;
        }
    }

    /// Writes one application frame regardless of the pause state.
    ///
    /// Reserved for the inbound task, which cannot wait on a pause it
    /// is itself holding.
    pub(crate) async fn write_direct(&self, b: &[u8]) -> io::Result<()> {
        let mut io = self.inner.io.lock().await;
        io.write_frame(b).await
    }

    /// Stops pause-gated writers until [`SharedSender::resume`].
    pub fn pause(&self) {
        *self.inner.paused.lock().unwrap() = true;
    }

    /// Releases paused writers.
    pub fn resume(&self) {
        *self.inner.paused.lock().unwrap() = false;
        self.inner.resumed.notify_waiters();
    }

    /// Whether the sender is currently paused.
    pub fn is_paused(&self) -> bool {
        *self.inner.paused.lock().unwrap()
    }

    /// Writes `header ++ payload` as one atomic frame through the
    /// pause-gated path.
    pub(crate) async fn signal(&self, header: Header, payload: &[u8]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(header.to_byte());
        buf.extend_from_slice(payload);
        self.write(&buf).await
    }
}

impl core::fmt::Debug for SharedSender {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedSender")
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// A per-stream view of the shared sender.
///
/// Every write is prefixed with the stream's packet header and a
/// 2-byte sub-header.
#[derive(Clone, Debug)]
pub struct StreamResponder {
    sender: SharedSender,
    header: Header,
    send_delay: Duration,
}

impl StreamResponder {
    pub(crate) fn new(sender: SharedSender, header: Header, send_delay: Duration) -> Self {
        Self {
            sender,
            header,
            send_delay,
        }
    }

    /// How many leading bytes [`StreamResponder::send_manual`] claims
    /// for headers.
    pub fn header_size(&self) -> usize {
        STREAM_HEADER_SIZE
    }

    async fn delay(&self) {
        if !self.send_delay.is_zero() {
            sleep(self.send_delay).await;
        }
    }

    /// Sends `data` under `marker`, segmenting into maximum-size
    /// stream bodies as needed. Zero-length data produces one
    /// empty-bodied frame.
    pub async fn send(&self, marker: u8, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        loop {
            let body_len = rest.len().min(STREAM_BODY_MAX_LEN);
            let sub = StreamHeader::new(marker, body_len as u16)?;

            let mut buf = Vec::with_capacity(STREAM_HEADER_SIZE + body_len);
            buf.push(self.header.to_byte());
            buf.extend_from_slice(&sub.to_bytes());
            buf.extend_from_slice(&rest[..body_len]);

            self.sender.write(&buf).await?;
            self.delay().await;

            rest = &rest[body_len..];
            if rest.is_empty() {
                return Ok(());
            }
        }
    }

    /// Sends `buf` as one unsegmented frame, writing the headers into
    /// its first [`StreamResponder::header_size`] bytes in place.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ValueTooLarge`] when the payload does
    /// not fit a single stream body, and
    /// [`ProtocolError::NotEnoughBuffer`] when `buf` cannot even hold
    /// the headers.
    pub async fn send_manual(&self, marker: u8, buf: &mut [u8]) -> io::Result<()> {
        if buf.len() < STREAM_HEADER_SIZE {
            return Err(ProtocolError::NotEnoughBuffer.into());
        }
        let body_len = buf.len() - STREAM_HEADER_SIZE;
        if body_len > STREAM_BODY_MAX_LEN {
            return Err(ProtocolError::ValueTooLarge.into());
        }
        let sub = StreamHeader::new(marker, body_len as u16)?;
        buf[0] = self.header.to_byte();
        buf[1..STREAM_HEADER_SIZE].copy_from_slice(&sub.to_bytes());

        self.sender.write(buf).await?;
        self.delay().await;
        Ok(())
    }

    /// Sends a bare stream-control signal (Close or Completed) for
    /// this stream id.
    pub async fn signal(&self, kind: HeaderKind) -> io::Result<()> {
        let header = Header::new(kind, self.header.data())?;
        if !header.is_stream_control() {
            return Err(Error::Protocol(ProtocolError::UnknownHeaderType).into());
        }
        self.sender.write(&[header.to_byte()]).await
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    /// Records every application frame it is asked to write.
    #[derive(Clone, Default)]
    pub(crate) struct RecordWriter(pub(crate) Arc<Mutex<Vec<Vec<u8>>>>);

    impl RecordWriter {
        pub(crate) fn frames(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().clone()
        }

        pub(crate) fn flat(&self) -> Vec<u8> {
            self.frames().concat()
        }
    }

    #[async_trait]
    impl FrameWrite for RecordWriter {
        async fn write_frame(&mut self, b: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().push(b.to_vec());
            Ok(())
        }
    }

    pub(crate) fn record_sender() -> (SharedSender, RecordWriter) {
        let rec = RecordWriter::default();
        (SharedSender::new(Box::new(rec.clone())), rec)
    }

    #[tokio::test]
    async fn test_write_passes_through() {
        let (sender, rec) = record_sender();
        sender.write(b"one").await.unwrap();
        sender.write(b"two").await.unwrap();
        assert_eq!(rec.frames(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_pause_blocks_write_until_resume() {
        let (sender, rec) = record_sender();
        sender.pause();

        let writer = sender.clone();
        let task = tokio::spawn(async move { writer.write(b"blocked").await });

        // Give the writer a chance to run; it must stay blocked.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rec.frames().is_empty());

        sender.resume();
        task.await.unwrap().unwrap();
        assert_eq!(rec.frames(), vec![b"blocked".to_vec()]);
    }

    #[tokio::test]
    async fn test_write_direct_bypasses_pause() {
        let (sender, rec) = record_sender();
        sender.pause();
        sender.write_direct(b"urgent").await.unwrap();
        assert_eq!(rec.frames(), vec![b"urgent".to_vec()]);
    }

    #[tokio::test]
    async fn test_pause_resume_idempotent() {
        let (sender, _rec) = record_sender();
        sender.pause();
        sender.pause();
        assert!(sender.is_paused());
        sender.resume();
        sender.resume();
        assert!(!sender.is_paused());
    }

    #[tokio::test]
    async fn test_responder_send_segments() {
        let (sender, rec) = record_sender();
        let responder = StreamResponder::new(
            sender,
            Header::new(HeaderKind::Stream, 5).unwrap(),
            Duration::ZERO,
        );

        let data = vec![0xcdu8; STREAM_BODY_MAX_LEN + 10];
        responder.send(2, &data).await.unwrap();

        let frames = rec.frames();
        assert_eq!(frames.len(), 2);

        let first = StreamHeader::from_bytes([frames[0][1], frames[0][2]]);
        assert_eq!(frames[0][0], 0x45);
        assert_eq!(first.marker(), 2);
        assert_eq!(usize::from(first.len()), STREAM_BODY_MAX_LEN);
        assert_eq!(frames[0].len(), STREAM_HEADER_SIZE + STREAM_BODY_MAX_LEN);

        let second = StreamHeader::from_bytes([frames[1][1], frames[1][2]]);
        assert_eq!(second.len(), 10);
        assert_eq!(frames[1].len(), STREAM_HEADER_SIZE + 10);
    }

    #[tokio::test]
    async fn test_responder_send_empty() {
        let (sender, rec) = record_sender();
        let responder = StreamResponder::new(
            sender,
            Header::new(HeaderKind::Stream, 0).unwrap(),
            Duration::ZERO,
        );
        responder.send(0, b"").await.unwrap();
        assert_eq!(rec.frames(), vec![vec![0x40, 0x00, 0x00]]);
    }

    #[tokio::test]
    async fn test_responder_send_manual() {
        let (sender, rec) = record_sender();
        let responder = StreamResponder::new(
            sender,
            Header::new(HeaderKind::Stream, 63).unwrap(),
            Duration::ZERO,
        );

        let mut buf = vec![0u8; responder.header_size()];
        buf.extend_from_slice(b"manual");
        responder.send_manual(1, &mut buf).await.unwrap();

        let frames = rec.frames();
        assert_eq!(frames[0][0], 0x7f);
        let sub = StreamHeader::from_bytes([frames[0][1], frames[0][2]]);
        assert_eq!(sub.marker(), 1);
        assert_eq!(sub.len(), 6);
        assert_eq!(&frames[0][3..], b"manual");
    }

    #[tokio::test]
    async fn test_responder_signal() {
        let (sender, rec) = record_sender();
        let responder = StreamResponder::new(
            sender,
            Header::new(HeaderKind::Stream, 63).unwrap(),
            Duration::ZERO,
        );
        responder.signal(HeaderKind::Close).await.unwrap();
        responder.signal(HeaderKind::Completed).await.unwrap();
        assert_eq!(rec.frames(), vec![vec![0xbf], vec![0xff]]);
    }
}
