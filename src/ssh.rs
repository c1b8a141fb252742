//! The SSH command machine (command id 0).
//!
//! Bootup parses the user name, remote address and auth method, then
//! spawns the backend task that dials and drives the SSH client
//! handshake. Host-key verification and credential entry are explicit
//! prompt states: the backend suspends on a single-shot channel, the
//! browser's response arrives through `step` on the inbound task and
//! resolves it. While a prompt is outstanding the connection's read
//! deadline keeps being extended from the prompt's
//! [`DeadlineBudget`] grant.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use russh::{client, ChannelMsg, Disconnect, Pty};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    command::CommandConfig,
    dial::{DeadlineBudget, Dialer, TimeoutStream},
    encoding::{Address, WireString},
    error::ProtocolError,
    fetch::LimitedReader,
    frame::{HeaderKind, StreamError, StreamHeader},
    fsm::{FsmError, Machine},
    sender::StreamResponder,
};

/// Server -> client: remote stdout bytes.
pub const SSH_SERVER_STDOUT: u8 = 0x00;
/// Server -> client: remote stderr bytes.
pub const SSH_SERVER_STDERR: u8 = 0x01;
/// Server -> client: the connect attempt failed; body is the error
/// text.
pub const SSH_SERVER_CONNECT_FAILED: u8 = 0x02;
/// Server -> client: shell is up.
pub const SSH_SERVER_CONNECT_SUCCEED: u8 = 0x03;
/// Server -> client: verify this host key fingerprint.
pub const SSH_SERVER_VERIFY_FINGERPRINT: u8 = 0x04;
/// Server -> client: supply the credential for the chosen auth
/// method.
pub const SSH_SERVER_REQUEST_CREDENTIAL: u8 = 0x05;

/// Client -> server: raw bytes for the remote shell's stdin.
pub const SSH_CLIENT_STDIN: u8 = 0x00;
/// Client -> server: terminal resize, 4 bytes of rows and columns.
pub const SSH_CLIENT_RESIZE: u8 = 0x01;
/// Client -> server: fingerprint verdict, one byte, zero confirms.
pub const SSH_CLIENT_RESPOND_FINGERPRINT: u8 = 0x02;
/// Client -> server: the requested credential bytes.
pub const SSH_CLIENT_RESPOND_CREDENTIAL: u8 = 0x03;

/// Bootup failed parsing the user name.
pub const SSH_ERROR_BAD_USER_NAME: StreamError = StreamError(0x01);
/// Bootup failed parsing the remote address.
pub const SSH_ERROR_BAD_REMOTE_ADDRESS: StreamError = StreamError(0x02);
/// Bootup found an unknown auth method selector.
pub const SSH_ERROR_BAD_AUTH_METHOD: StreamError = StreamError(0x03);

const CREDENTIAL_MAX_SIZE: usize = 4096;

const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// The auth method selector carried in the bootup payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum AuthMethod {
    None,
    Passphrase,
    PrivateKey,
}

impl AuthMethod {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Passphrase),
            0x02 => Some(Self::PrivateKey),
            _ => None,
        }
    }

    fn needs_credential(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Where the backend task is in its handshake.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DialStatus {
    /// Dialing or key exchange in progress.
    #[default]
    Dialing,

    /// Suspended on the browser's fingerprint verdict.
    WaitingFingerprint,

    /// Suspended on the browser's credential.
    WaitingCredential,

    /// Shell is up; payload is flowing.
    Connected,

    /// The backend is gone.
    Failed,
}

/// Operations the inbound task forwards to the backend task.
enum SshOp {
    Stdin(Vec<u8>),
    Resize { rows: u16, cols: u16 },
}

/// The SSH command machine.
pub struct SshCommand {
    responder: StreamResponder,
    dialer: Dialer,
    dial_timeout: Duration,
    budget: DeadlineBudget,

    fingerprint_tx: Option<oneshot::Sender<bool>>,
    fingerprint_rx: Option<oneshot::Receiver<bool>>,
    fingerprint_processed: bool,

    credential_tx: Option<oneshot::Sender<Vec<u8>>>,
    credential_rx: Option<oneshot::Receiver<Vec<u8>>>,
    credential_processed: bool,

    ops_tx: Option<mpsc::UnboundedSender<SshOp>>,
    ops_rx: Option<mpsc::UnboundedReceiver<SshOp>>,

    status_tx: watch::Sender<DialStatus>,
    status_rx: watch::Receiver<DialStatus>,

    backend: Option<JoinHandle<()>>,
}

impl SshCommand {
    /// Builds the machine for one freshly opened stream.
    pub fn new(responder: StreamResponder, cfg: &CommandConfig) -> Self {
        let (fingerprint_tx, fingerprint_rx) = oneshot::channel();
        let (credential_tx, credential_rx) = oneshot::channel();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(DialStatus::default());
        Self {
            responder,
            dialer: cfg.dialer.clone(),
            dial_timeout: cfg.dial_timeout,
            budget: DeadlineBudget::new(),
            fingerprint_tx: Some(fingerprint_tx),
            fingerprint_rx: Some(fingerprint_rx),
            fingerprint_processed: false,
            credential_tx: Some(credential_tx),
            credential_rx: Some(credential_rx),
            credential_processed: false,
            ops_tx: Some(ops_tx),
            ops_rx: Some(ops_rx),
            status_tx,
            status_rx,
            backend: None,
        }
    }

    /// The backend task's current handshake phase.
    pub fn dial_status(&self) -> DialStatus {
        *self.status_rx.borrow()
    }
}

impl core::fmt::Debug for SshCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SshCommand")
            .field("status", &self.dial_status())
            .finish()
    }
}

#[async_trait::async_trait]
impl Machine for SshCommand {
    async fn bootup(&mut self, r: &mut LimitedReader<'_>) -> Result<(), FsmError> {
        let user = WireString::parse(r)
            .await
            .map_err(|e| FsmError::new(e, SSH_ERROR_BAD_USER_NAME))?;

        let address = Address::parse(r)
            .await
            .map_err(|e| FsmError::new(e, SSH_ERROR_BAD_REMOTE_ADDRESS))?;

        let method = r
            .fetch_one_byte()
            .await
            .map_err(|e| FsmError::new(e, SSH_ERROR_BAD_AUTH_METHOD))
            .and_then(|b| {
                AuthMethod::from_byte(b)
                    .ok_or_else(|| FsmError::new("invalid auth method", SSH_ERROR_BAD_AUTH_METHOD))
            })?;

        let backend = Backend {
            responder: self.responder.clone(),
            dialer: self.dialer.clone(),
            dial_timeout: self.dial_timeout,
            budget: self.budget.clone(),
            status: self.status_tx.clone(),
            user: user.to_text(),
            host: address.host_text(),
            port: address.port(),
            method,
            fingerprint_rx: Some(self.fingerprint_rx.take().expect("bootup runs once")),
            credential_rx: self.credential_rx.take().expect("bootup runs once"),
            ops_rx: self.ops_rx.take().expect("bootup runs once"),
        };
        self.backend = Some(tokio::spawn(backend.run()));

        Ok(())
    }

    async fn step(&mut self, r: &mut LimitedReader<'_>, header: StreamHeader) -> io::Result<()> {
        match header.marker() {
            SSH_CLIENT_STDIN => {
                while !r.completed() {
                    let data = r.buffered().await?;
                    let Some(ops) = &self.ops_tx else {
                        return Err(ProtocolError::RemoteUnavailable.into());
                    };
                    if ops.send(SshOp::Stdin(data.to_vec())).is_err() {
                        return Err(ProtocolError::RemoteUnavailable.into());
                    }
                }
                Ok(())
            }

            SSH_CLIENT_RESIZE => {
                let mut b = [0u8; 4];
                r.read_exact(&mut b).await?;
                let rows = u16::from_be_bytes([b[0], b[1]]);
                let cols = u16::from_be_bytes([b[2], b[3]]);

                let Some(ops) = &self.ops_tx else {
                    return Err(ProtocolError::RemoteUnavailable.into());
                };
                if ops.send(SshOp::Resize { rows, cols }).is_err() {
                    return Err(ProtocolError::RemoteUnavailable.into());
                }
                Ok(())
            }

            SSH_CLIENT_RESPOND_FINGERPRINT => {
                if self.fingerprint_processed {
                    return Err(ProtocolError::UnexpectedFingerprintRespond.into());
                }
                self.fingerprint_processed = true;

                let confirmed = r.fetch_one_byte().await? == 0;
                if let Some(tx) = self.fingerprint_tx.take() {
                    // The backend may already be gone; its exit is the
                    // answer then.
                    let _ = tx.send(confirmed);
                }
                Ok(())
            }

            SSH_CLIENT_RESPOND_CREDENTIAL => {
                if self.credential_processed {
                    return Err(ProtocolError::UnexpectedCredentialRespond.into());
                }
                self.credential_processed = true;

                if r.remains() > CREDENTIAL_MAX_SIZE {
                    return Err(ProtocolError::CredentialTooLarge.into());
                }
                let mut buf = vec![0u8; r.remains()];
                r.read_exact(&mut buf).await?;

                if let Some(tx) = self.credential_tx.take() {
                    let _ = tx.send(buf);
                }
                Ok(())
            }

            marker => Err(ProtocolError::UnknownClientSignal { marker }.into()),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.fingerprint_processed = true;
        self.credential_processed = true;

        // Dropping the prompt and op senders cancels any outstanding
        // wait and ends the backend loop.
        self.fingerprint_tx.take();
        self.credential_tx.take();
        self.ops_tx.take();

        if let Some(task) = self.backend.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn release(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Everything the backend task owns.
struct Backend {
    responder: StreamResponder,
    dialer: Dialer,
    dial_timeout: Duration,
    budget: DeadlineBudget,
    status: watch::Sender<DialStatus>,
    user: String,
    host: String,
    port: u16,
    method: AuthMethod,
    fingerprint_rx: Option<oneshot::Receiver<bool>>,
    credential_rx: oneshot::Receiver<Vec<u8>>,
    ops_rx: mpsc::UnboundedReceiver<SshOp>,
}

/// Verifies the host key against the browser during key exchange.
struct FingerprintPrompt {
    responder: StreamResponder,
    budget: DeadlineBudget,
    status: watch::Sender<DialStatus>,
    verdict: Option<oneshot::Receiver<bool>>,
}

impl client::Handler for FingerprintPrompt {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(verdict) = self.verdict.take() else {
            return Ok(false);
        };

        let fingerprint = server_public_key
            .fingerprint(russh::keys::ssh_key::HashAlg::Sha256)
            .to_string();

        self.status.send_replace(DialStatus::WaitingFingerprint);
        self.budget.grant();
        let confirmed = async {
            self.responder
                .send(SSH_SERVER_VERIFY_FINGERPRINT, fingerprint.as_bytes())
                .await
                .ok()?;
            verdict.await.ok()
        }
        .await;
        self.budget.settle();

        Ok(confirmed.unwrap_or(false))
    }
}

impl Backend {
    async fn run(self) {
        let responder = self.responder.clone();
        let status = self.status.clone();

        if let Err(e) = self.serve().await {
            debug!(error = %e, "ssh backend ended with error");
        }
        status.send_replace(DialStatus::Failed);

        // The browser learns the stream is done through Close; the
        // table frees the id once the peer answers Completed.
        let _ = responder.signal(HeaderKind::Close).await;
    }

    async fn serve(mut self) -> io::Result<()> {
        let (handle, mut channel) = match self.connect().await {
            Ok(connected) => connected,
            Err(e) => {
                debug!(error = %e, "unable to connect to remote machine");
                let _ = self
                    .responder
                    .send(SSH_SERVER_CONNECT_FAILED, e.to_string().as_bytes())
                    .await;
                return Ok(());
            }
        };

        self.status.send_replace(DialStatus::Connected);
        self.responder
            .send(SSH_SERVER_CONNECT_SUCCEED, b"")
            .await?;
        debug!("serving");

        loop {
            tokio::select! {
                msg = channel.wait() => match msg {
                    None => break,
                    Some(ChannelMsg::Data { data }) => {
                        self.responder.send(SSH_SERVER_STDOUT, &data).await?;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext })
                        if ext == SSH_EXTENDED_DATA_STDERR =>
                    {
                        self.responder.send(SSH_SERVER_STDERR, &data).await?;
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => break,
                    Some(_) => {}
                },
                op = self.ops_rx.recv() => match op {
                    None => break,
                    Some(SshOp::Stdin(data)) => {
                        if channel.data(&data[..]).await.is_err() {
                            debug!("failed to write data to remote");
                            break;
                        }
                    }
                    Some(SshOp::Resize { rows, cols }) => {
                        if let Err(e) = channel
                            .window_change(u32::from(cols), u32::from(rows), 0, 0)
                            .await
                        {
                            debug!(rows, cols, error = %e, "failed to resize");
                        }
                    }
                },
            }
        }

        let _ = channel.eof().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await;
        Ok(())
    }

    async fn connect(
        &mut self,
    ) -> io::Result<(
        client::Handle<FingerprintPrompt>,
        russh::Channel<client::Msg>,
    )> {
        let stream = self
            .dialer
            .dial(&self.host, self.port, self.dial_timeout)
            .await?;
        let stream = TimeoutStream::new(
            stream,
            self.dial_timeout,
            self.dial_timeout,
            self.budget.clone(),
        );

        let prompt = FingerprintPrompt {
            responder: self.responder.clone(),
            budget: self.budget.clone(),
            status: self.status.clone(),
            verdict: self.fingerprint_rx.take(),
        };

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, stream, prompt)
            .await
            .map_err(io::Error::other)?;

        let authenticated = self.authenticate(&mut handle).await?;
        if !authenticated {
            return Err(io::Error::other("authentication failed"));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(io::Error::other)?;
        // 40 columns by 80 rows; the browser follows up with a resize
        // once its terminal is measured.
        channel
            .request_pty(
                false,
                "xterm",
                40,
                80,
                0,
                0,
                &[
                    (Pty::ECHO, 1),
                    (Pty::TTY_OP_ISPEED, 14400),
                    (Pty::TTY_OP_OSPEED, 14400),
                ],
            )
            .await
            .map_err(io::Error::other)?;
        channel.request_shell(false).await.map_err(io::Error::other)?;

        // The deadline machinery guards only the dial and prompt
        // phase; an interactive session may sit idle indefinitely.
        self.budget.disarm();

        Ok((handle, channel))
    }

    async fn authenticate(
        &mut self,
        handle: &mut client::Handle<FingerprintPrompt>,
    ) -> io::Result<bool> {
        fn succeeded(result: &client::AuthResult) -> bool {
            matches!(result, client::AuthResult::Success)
        }

        if !self.method.needs_credential() {
            let result = handle
                .authenticate_none(self.user.as_str())
                .await
                .map_err(io::Error::other)?;
            return Ok(succeeded(&result));
        }

        self.status.send_replace(DialStatus::WaitingCredential);
        self.budget.grant();
        self.responder
            .send(SSH_SERVER_REQUEST_CREDENTIAL, b"")
            .await?;
        let credential = (&mut self.credential_rx).await;
        self.budget.settle();

        let credential =
            credential.map_err(|_| io::Error::other("authentication has been cancelled"))?;

        let result = match self.method {
            AuthMethod::Passphrase => handle
                .authenticate_password(
                    self.user.as_str(),
                    String::from_utf8_lossy(&credential).into_owned(),
                )
                .await
                .map_err(io::Error::other)?,
            AuthMethod::PrivateKey => {
                let pem = std::str::from_utf8(&credential)
                    .map_err(|_| io::Error::other("private key is not valid text"))?;
                let key = russh::keys::decode_secret_key(pem, None)
                    .map_err(io::Error::other)?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(io::Error::other)?
                    .flatten();
                handle
                    .authenticate_publickey(
                        self.user.as_str(),
                        russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
                    .map_err(io::Error::other)?
            }
            AuthMethod::None => unreachable!("handled above"),
        };
        Ok(succeeded(&result))
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;
    use crate::{
        config::ServerConfig,
        encoding::HostKind,
        error,
        fetch::{test::ChainSource, FetchReader},
        frame::Header,
        hook::HookRunner,
        sender::test::record_sender,
        spec::STREAM_HEADER_SIZE,
    };

    fn refusing_config() -> CommandConfig {
        // An empty allow-list makes every dial fail fast without
        // touching the network.
        CommandConfig {
            dialer: Dialer::new(None, Some(HashSet::new())),
            dial_timeout: Duration::from_millis(200),
            hooks: Arc::new(HookRunner::empty()),
            presets: Arc::new(Vec::new()),
        }
    }

    fn machine_on_stream(id: u8) -> (SshCommand, crate::sender::test::RecordWriter) {
        let (sender, rec) = record_sender();
        let responder = StreamResponder::new(
            sender,
            Header::new(crate::frame::HeaderKind::Stream, id).unwrap(),
            Duration::ZERO,
        );
        (SshCommand::new(responder, &refusing_config()), rec)
    }

    fn bootup_payload(method: u8) -> Vec<u8> {
        let mut out = Vec::new();
        WireString::new(b"root".to_vec())
            .unwrap()
            .marshal(&mut out)
            .unwrap();
        Address::new(HostKind::Loopback, 22)
            .unwrap()
            .marshal(&mut out)
            .unwrap();
        out.push(method);
        out
    }

    async fn boot(machine: &mut SshCommand, payload: &[u8]) -> Result<(), FsmError> {
        let mut r = FetchReader::new(Box::new(ChainSource::new([payload.to_vec()])));
        let mut lr = LimitedReader::new(&mut r, payload.len());
        machine.bootup(&mut lr).await
    }

    async fn step_frame(
        machine: &mut SshCommand,
        marker: u8,
        body: &[u8],
    ) -> io::Result<()> {
        let mut r = FetchReader::new(Box::new(ChainSource::new([body.to_vec()])));
        let mut lr = LimitedReader::new(&mut r, body.len());
        let header = StreamHeader::new(marker, body.len() as u16).unwrap();
        machine.step(&mut lr, header).await
    }

    #[tokio::test]
    async fn test_bootup_rejects_bad_auth_method() {
        let (mut machine, _rec) = machine_on_stream(0);
        let err = boot(&mut machine, &bootup_payload(0x07)).await.unwrap_err();
        assert_eq!(err.code(), SSH_ERROR_BAD_AUTH_METHOD);
    }

    #[tokio::test]
    async fn test_bootup_rejects_truncated_address() {
        let (mut machine, _rec) = machine_on_stream(0);
        let mut payload = Vec::new();
        WireString::new(b"root".to_vec())
            .unwrap()
            .marshal(&mut payload)
            .unwrap();
        payload.push(0x00); // half a port, then nothing
        let err = boot(&mut machine, &payload).await.unwrap_err();
        assert_eq!(err.code(), SSH_ERROR_BAD_REMOTE_ADDRESS);
    }

    #[tokio::test]
    async fn test_failed_dial_reports_and_closes() {
        let (mut machine, rec) = machine_on_stream(7);
        boot(&mut machine, &bootup_payload(0x00)).await.unwrap();
        machine.close().await.unwrap();

        let frames = rec.frames();
        assert!(frames.len() >= 2);

        // The failure report carries the dial error text.
        assert_eq!(frames[0][0], 0x47);
        let sub = StreamHeader::from_bytes([frames[0][1], frames[0][2]]);
        assert_eq!(sub.marker(), SSH_SERVER_CONNECT_FAILED);
        assert!(!frames[0][STREAM_HEADER_SIZE..].is_empty());

        // The backend signals Close on its way out.
        assert_eq!(frames.last().unwrap(), &vec![0x80 | 7]);
        assert_eq!(machine.dial_status(), DialStatus::Failed);
    }

    #[tokio::test]
    async fn test_credential_replay_is_rejected() {
        let (mut machine, _rec) = machine_on_stream(0);
        boot(&mut machine, &bootup_payload(0x01)).await.unwrap();

        step_frame(&mut machine, SSH_CLIENT_RESPOND_CREDENTIAL, b"hunter2")
            .await
            .unwrap();
        let err = step_frame(&mut machine, SSH_CLIENT_RESPOND_CREDENTIAL, b"hunter2")
            .await
            .unwrap_err();
        let err = err.downcast::<error::Error>().unwrap();
        assert_eq!(
            err,
            error::Error::Protocol(ProtocolError::UnexpectedCredentialRespond)
        );

        machine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fingerprint_replay_is_rejected() {
        let (mut machine, _rec) = machine_on_stream(0);
        boot(&mut machine, &bootup_payload(0x00)).await.unwrap();

        step_frame(&mut machine, SSH_CLIENT_RESPOND_FINGERPRINT, &[0x00])
            .await
            .unwrap();
        let err = step_frame(&mut machine, SSH_CLIENT_RESPOND_FINGERPRINT, &[0x00])
            .await
            .unwrap_err();
        let err = err.downcast::<error::Error>().unwrap();
        assert_eq!(
            err,
            error::Error::Protocol(ProtocolError::UnexpectedFingerprintRespond)
        );

        machine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversize_credential_is_rejected() {
        let (mut machine, _rec) = machine_on_stream(0);
        boot(&mut machine, &bootup_payload(0x01)).await.unwrap();

        let big = vec![0u8; CREDENTIAL_MAX_SIZE + 1];
        let err = step_frame(&mut machine, SSH_CLIENT_RESPOND_CREDENTIAL, &big)
            .await
            .unwrap_err();
        let err = err.downcast::<error::Error>().unwrap();
        assert_eq!(
            err,
            error::Error::Protocol(ProtocolError::CredentialTooLarge)
        );

        machine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_marker_is_rejected() {
        let (mut machine, _rec) = machine_on_stream(0);
        boot(&mut machine, &bootup_payload(0x00)).await.unwrap();

        let err = step_frame(&mut machine, 0x07, b"").await.unwrap_err();
        let err = err.downcast::<error::Error>().unwrap();
        assert_eq!(
            err,
            error::Error::Protocol(ProtocolError::UnknownClientSignal { marker: 7 })
        );

        machine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stdin_after_backend_gone_is_remote_unavailable() {
        let (mut machine, _rec) = machine_on_stream(0);
        boot(&mut machine, &bootup_payload(0x00)).await.unwrap();
        machine.close().await.unwrap();

        let err = step_frame(&mut machine, SSH_CLIENT_STDIN, b"ls\n")
            .await
            .unwrap_err();
        let err = err.downcast::<error::Error>().unwrap();
        assert_eq!(
            err,
            error::Error::Protocol(ProtocolError::RemoteUnavailable)
        );
    }

    // ServerConfig is exercised here to keep the dial policy honest:
    // the machine must see the allow-list through the dialer it was
    // handed, not through global state.
    #[tokio::test]
    async fn test_dialer_policy_comes_from_config() {
        let cfg = ServerConfig {
            only_allow_preset_remotes: true,
            ..Default::default()
        };
        let command_cfg = CommandConfig {
            dialer: cfg.dialer(),
            dial_timeout: Duration::from_millis(200),
            hooks: Arc::new(HookRunner::empty()),
            presets: Arc::new(cfg.presets.clone()),
        };

        let (sender, rec) = record_sender();
        let responder = StreamResponder::new(
            sender,
            Header::new(crate::frame::HeaderKind::Stream, 1).unwrap(),
            Duration::ZERO,
        );
        let mut machine = SshCommand::new(responder, &command_cfg);
        boot(&mut machine, &bootup_payload(0x00)).await.unwrap();
        machine.close().await.unwrap();

        let frames = rec.frames();
        let sub = StreamHeader::from_bytes([frames[0][1], frames[0][2]]);
        assert_eq!(sub.marker(), SSH_SERVER_CONNECT_FAILED);
    }
}
