//! Termwire is the multiplexing protocol runtime of a web terminal
//! gateway: a browser opens one framed, authenticated connection and
//! drives many independent remote terminal sessions (SSH or Telnet)
//! over it.
//!
//! ## Protocol shape
//!
//! One websocket binary connection carries an AES-GCM sealed byte
//! stream (see [`transport`]). Inside it, application frames start
//! with a single packed header byte: 2 bits of type, 6 bits of data
//! (see [`frame`]). Control frames carry heartbeat echoes and the
//! pause/resume flow control; Stream frames open and drive up to 64
//! concurrent logical streams, each bound to a backend network session
//! through a command state machine; Close and Completed manage the
//! per-stream shutdown handshake.
//!
//! ## Quick start
//!
//! The embedder terminates HTTP, upgrades the websocket and performs
//! the auth handshake with [`SessionAuth`]; everything after that is
//! [`serve_websocket`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use termwire::{serve_websocket, CommandSet, HookRunner, ServerConfig, SessionAuth};
//!
//! # async fn accept(ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
//! #                 presented_auth_key: &[u8]) -> std::io::Result<()> {
//! let config = ServerConfig::default();
//! let auth = SessionAuth::new(config.shared_key.clone());
//!
//! // ... send auth.random_key() to the client, read its answer ...
//! auth.verify(presented_auth_key).await.map_err(std::io::Error::from)?;
//!
//! serve_websocket(
//!     ws,
//!     &auth,
//!     &config,
//!     Arc::new(CommandSet::standard()),
//!     Arc::new(HookRunner::empty()),
//! )
//! .await
//! # }
//! ```
//!
//! ## Concurrency discipline
//!
//! Each session runs exactly one inbound task (the demux loop in
//! [`handler`]) plus one backend task per live stream. The single
//! [`sender::SharedSender`] is the only synchronization point both
//! task classes touch; its pause gate is waited on exclusively by
//! backend tasks, while the inbound task bypasses it. The stream
//! table is owned by the inbound task alone.
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod command;
pub mod config;
pub mod dial;
pub mod encoding;
pub mod error;
pub mod fetch;
pub mod frame;
pub mod fsm;
pub mod handler;
pub mod hook;
pub mod sender;
pub mod ssh;
pub mod telnet;
pub mod transport;
pub mod ws;

mod crypto;
mod spec;
mod streams;

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

pub use auth::SessionAuth;
pub use command::{CommandConfig, CommandSet};
pub use config::{Preset, ServerConfig};
pub use crypto::{SessionRandom, TransportKey};
pub use error::Error;
pub use handler::Session;
pub use hook::HookRunner;
pub use streams::StreamPhase;

/// Runs one authenticated session over an upgraded websocket until the
/// connection closes or a protocol error tears it down.
///
/// The caller has already verified the client's auth key against
/// `auth`; this performs the plaintext nonce exchange, seals the
/// transport with the current time-bucket key, and drives the demux
/// loop.
pub async fn serve_websocket<S>(
    websocket: WebSocketStream<S>,
    auth: &SessionAuth,
    config: &ServerConfig,
    commands: Arc<CommandSet>,
    hooks: Arc<HookRunner>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (source, sink) = ws::split_websocket(websocket);
    let key = auth.transport_key();
    let (opener, sealer) = tokio::time::timeout(
        config.initial_timeout,
        transport::establish(Box::new(source), Box::new(sink), &key),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "transport handshake timed out"))??;

    let command_cfg = CommandConfig {
        dialer: config.dialer(),
        dial_timeout: config.dial_timeout,
        hooks,
        presets: Arc::new(config.presets.clone()),
    };

    let mut session = Session::new(
        fetch::FetchReader::new(Box::new(opener)),
        Box::new(sealer),
        commands,
        command_cfg,
        config.read_timeout,
        config.read_delay,
        config.write_delay,
    );
    session.handle().await
}
