//! The Telnet command machine (command id 1).
//!
//! Bootup parses the remote address and spawns the backend task. The
//! backend first runs the before-connecting hooks, streaming their
//! output to the browser, then dials and forwards bytes verbatim in
//! both directions; Telnet option negotiation is the browser's
//! business.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    command::CommandConfig,
    dial::Dialer,
    encoding::Address,
    error::ProtocolError,
    fetch::LimitedReader,
    frame::{HeaderKind, StreamError, StreamHeader},
    fsm::{FsmError, Machine},
    hook::{HookOutput, HookRunner, HookType},
    sender::StreamResponder,
};

/// Server -> client: in-band bytes from the remote.
pub const TELNET_SERVER_REMOTE_BAND: u8 = 0x00;
/// Server -> client: the dial failed; body is the error text.
pub const TELNET_SERVER_DIAL_FAILED: u8 = 0x01;
/// Server -> client: the remote is connected.
pub const TELNET_SERVER_DIAL_CONNECTED: u8 = 0x02;
/// Server -> client: output of a before-connecting hook.
pub const TELNET_SERVER_HOOK_OUTPUT_BEFORE_CONNECTING: u8 = 0x03;

/// Bootup failed parsing the remote address.
pub const TELNET_ERROR_BAD_REMOTE_ADDRESS: StreamError = StreamError(0x01);

/// The Telnet command machine.
pub struct TelnetCommand {
    responder: StreamResponder,
    dialer: Dialer,
    dial_timeout: Duration,
    hooks: Arc<HookRunner>,
    data_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    data_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    backend: Option<JoinHandle<()>>,
}

impl TelnetCommand {
    /// Builds the machine for one freshly opened stream.
    pub fn new(responder: StreamResponder, cfg: &CommandConfig) -> Self {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        Self {
            responder,
            dialer: cfg.dialer.clone(),
            dial_timeout: cfg.dial_timeout,
            hooks: cfg.hooks.clone(),
            data_tx: Some(data_tx),
            data_rx: Some(data_rx),
            backend: None,
        }
    }
}

impl core::fmt::Debug for TelnetCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TelnetCommand")
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

#[async_trait]
impl Machine for TelnetCommand {
    async fn bootup(&mut self, r: &mut LimitedReader<'_>) -> Result<(), FsmError> {
        let address = Address::parse(r)
            .await
            .map_err(|e| FsmError::new(e, TELNET_ERROR_BAD_REMOTE_ADDRESS))?;

        let backend = Backend {
            responder: self.responder.clone(),
            dialer: self.dialer.clone(),
            dial_timeout: self.dial_timeout,
            hooks: self.hooks.clone(),
            host: address.host_text(),
            port: address.port(),
            target: address.to_string(),
            data_rx: self.data_rx.take().expect("bootup runs once"),
        };
        self.backend = Some(tokio::spawn(backend.run()));

        Ok(())
    }

    async fn step(&mut self, r: &mut LimitedReader<'_>, _header: StreamHeader) -> io::Result<()> {
        // All Telnet requests are in-band; every frame body goes to the
        // backend untouched.
        while !r.completed() {
            let data = r.buffered().await?;
            let Some(tx) = &self.data_tx else {
                return Err(ProtocolError::RemoteUnavailable.into());
            };
            if tx.send(data.to_vec()).is_err() {
                return Err(ProtocolError::RemoteUnavailable.into());
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.data_tx.take();
        if let Some(task) = self.backend.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn release(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Backend {
    responder: StreamResponder,
    dialer: Dialer,
    dial_timeout: Duration,
    hooks: Arc<HookRunner>,
    host: String,
    port: u16,
    target: String,
    data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Streams hook stdout to the browser; stderr goes to the server log.
struct HookToBrowser {
    responder: StreamResponder,
}

#[async_trait]
impl HookOutput for HookToBrowser {
    async fn out(&mut self, b: &[u8]) -> io::Result<()> {
        self.responder
            .send(TELNET_SERVER_HOOK_OUTPUT_BEFORE_CONNECTING, b)
            .await
    }

    async fn err(&mut self, b: &[u8]) -> io::Result<()> {
        info!(output = %String::from_utf8_lossy(b), "server hook reported");
        Ok(())
    }
}

impl Backend {
    async fn run(self) {
        let responder = self.responder.clone();

        if let Err(e) = self.serve().await {
            debug!(error = %e, "telnet backend ended with error");
        }

        let _ = responder.signal(HeaderKind::Close).await;
    }

    async fn serve(mut self) -> io::Result<()> {
        if self.hooks.has(HookType::BeforeConnecting) {
            let mut output = HookToBrowser {
                responder: self.responder.clone(),
            };
            let params = [("remote address".to_owned(), self.target.clone())];
            if let Err(e) = self
                .hooks
                .run(HookType::BeforeConnecting, &params, &mut output)
                .await
            {
                let _ = self
                    .responder
                    .send(TELNET_SERVER_DIAL_FAILED, e.to_string().as_bytes())
                    .await;
                return Ok(());
            }
        }

        let stream = match self.dialer.dial(&self.host, self.port, self.dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(target = %self.target, error = %e, "telnet dial failed");
                let _ = self
                    .responder
                    .send(TELNET_SERVER_DIAL_FAILED, e.to_string().as_bytes())
                    .await;
                return Ok(());
            }
        };

        self.responder
            .send(TELNET_SERVER_DIAL_CONNECTED, b"")
            .await?;
        debug!(target = %self.target, "serving");

        let (mut remote_read, mut remote_write) = stream.into_split();
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                n = remote_read.read(&mut buf) => {
                    let n = match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    self.responder
                        .send(TELNET_SERVER_REMOTE_BAND, &buf[..n])
                        .await?;
                }
                data = self.data_rx.recv() => match data {
                    None => break,
                    Some(data) => {
                        if let Err(e) = remote_write.write_all(&data).await {
                            debug!(error = %e, "failed to write data to remote");
                        }
                    }
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::{HashMap, HashSet};

    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        encoding::HostKind,
        fetch::{test::ChainSource, FetchReader},
        frame::Header,
        sender::test::{record_sender, RecordWriter},
        spec::STREAM_HEADER_SIZE,
    };

    fn command_config(dialer: Dialer, hooks: HookRunner) -> CommandConfig {
        CommandConfig {
            dialer,
            dial_timeout: Duration::from_secs(2),
            hooks: Arc::new(hooks),
            presets: Arc::new(Vec::new()),
        }
    }

    fn machine_with(cfg: &CommandConfig) -> (TelnetCommand, RecordWriter) {
        let (sender, rec) = record_sender();
        let responder = StreamResponder::new(
            sender,
            Header::new(crate::frame::HeaderKind::Stream, 9).unwrap(),
            Duration::ZERO,
        );
        (TelnetCommand::new(responder, cfg), rec)
    }

    fn address_payload(host: HostKind, port: u16) -> Vec<u8> {
        let mut out = Vec::new();
        Address::new(host, port).unwrap().marshal(&mut out).unwrap();
        out
    }

    async fn boot(machine: &mut TelnetCommand, payload: &[u8]) -> Result<(), FsmError> {
        let mut r = FetchReader::new(Box::new(ChainSource::new([payload.to_vec()])));
        let mut lr = LimitedReader::new(&mut r, payload.len());
        machine.bootup(&mut lr).await
    }

    async fn step_data(machine: &mut TelnetCommand, body: &[u8]) -> io::Result<()> {
        let mut r = FetchReader::new(Box::new(ChainSource::new([body.to_vec()])));
        let mut lr = LimitedReader::new(&mut r, body.len());
        let header = StreamHeader::new(0, body.len() as u16).unwrap();
        machine.step(&mut lr, header).await
    }

    fn marker_of(frame: &[u8]) -> u8 {
        if frame.len() < STREAM_HEADER_SIZE {
            return 0xff;
        }
        StreamHeader::from_bytes([frame[1], frame[2]]).marker()
    }

    #[tokio::test]
    async fn test_bootup_rejects_bad_address() {
        let cfg = command_config(Dialer::direct(), HookRunner::empty());
        let (mut machine, _rec) = machine_with(&cfg);
        // Three header bytes only; the declared IPv4 body is missing.
        let err = boot(&mut machine, &[0x00, 0x17, 0x40]).await.unwrap_err();
        assert_eq!(err.code(), TELNET_ERROR_BAD_REMOTE_ADDRESS);
    }

    #[tokio::test]
    async fn test_dial_failure_reports_and_closes() {
        let cfg = command_config(Dialer::new(None, Some(HashSet::new())), HookRunner::empty());
        let (mut machine, rec) = machine_with(&cfg);
        boot(&mut machine, &address_payload(HostKind::Loopback, 23))
            .await
            .unwrap();
        machine.close().await.unwrap();

        let frames = rec.frames();
        assert_eq!(marker_of(&frames[0]), TELNET_SERVER_DIAL_FAILED);
        assert!(!frames[0][STREAM_HEADER_SIZE..].is_empty());
        assert_eq!(frames.last().unwrap(), &vec![0x80 | 9]);
    }

    #[tokio::test]
    async fn test_forwarding_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let remote = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"welcome").await.unwrap();

            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });

        let cfg = command_config(Dialer::direct(), HookRunner::empty());
        let (mut machine, rec) = machine_with(&cfg);
        boot(
            &mut machine,
            &address_payload(HostKind::V4([127, 0, 0, 1]), port),
        )
        .await
        .unwrap();

        step_data(&mut machine, b"hello").await.unwrap();
        remote.await.unwrap();
        machine.close().await.unwrap();

        let frames = rec.frames();
        assert_eq!(marker_of(&frames[0]), TELNET_SERVER_DIAL_CONNECTED);
        assert_eq!(frames[0].len(), STREAM_HEADER_SIZE);

        let band: Vec<u8> = frames
            .iter()
            .filter(|f| f.len() > STREAM_HEADER_SIZE && marker_of(f) == TELNET_SERVER_REMOTE_BAND)
            .flat_map(|f| f[STREAM_HEADER_SIZE..].to_vec())
            .collect();
        assert_eq!(band, b"welcome");

        assert_eq!(rec.frames().last().unwrap(), &vec![0x80 | 9]);
    }

    #[tokio::test]
    async fn test_hook_output_streams_to_browser() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let hooks = HookRunner::new(
            HashMap::from([(
                HookType::BeforeConnecting,
                vec![vec![
                    "/bin/sh".to_owned(),
                    "-c".to_owned(),
                    "printf checking".to_owned(),
                ]],
            )]),
            Duration::from_secs(5),
        );
        let cfg = command_config(Dialer::direct(), hooks);
        let (mut machine, rec) = machine_with(&cfg);
        boot(
            &mut machine,
            &address_payload(HostKind::V4([127, 0, 0, 1]), port),
        )
        .await
        .unwrap();

        // Wait for the backend to get past the hook and the dial.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let markers: Vec<u8> = rec.frames().iter().map(|f| marker_of(f)).collect();
            if markers.contains(&TELNET_SERVER_DIAL_CONNECTED) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "backend never connected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        machine.close().await.unwrap();

        let frames = rec.frames();
        assert_eq!(
            marker_of(&frames[0]),
            TELNET_SERVER_HOOK_OUTPUT_BEFORE_CONNECTING
        );
        assert_eq!(&frames[0][STREAM_HEADER_SIZE..], b"checking");
    }

    #[tokio::test]
    async fn test_data_after_close_is_remote_unavailable() {
        let cfg = command_config(Dialer::new(None, Some(HashSet::new())), HookRunner::empty());
        let (mut machine, _rec) = machine_with(&cfg);
        boot(&mut machine, &address_payload(HostKind::Loopback, 23))
            .await
            .unwrap();
        machine.close().await.unwrap();

        assert!(step_data(&mut machine, b"x").await.is_err());
    }
}
