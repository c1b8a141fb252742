//! Websocket bindings for the session transport.
//!
//! The gateway speaks to the browser in binary websocket messages; the
//! surrounding HTTP upgrade, TLS and host checking belong to the
//! embedder. This module adapts the two halves of a
//! [`WebSocketStream`] to the transport's [`ChunkSource`] and
//! [`MessageSink`] boundaries.

use std::io::{self, ErrorKind};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use crate::{error::TransportError, fetch::ChunkSource, transport::MessageSink};

/// Splits a websocket into the transport's source and sink halves.
pub fn split_websocket<S>(ws: WebSocketStream<S>) -> (WebSocketSource<S>, WebSocketSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (WebSocketSource(stream), WebSocketSink(sink))
}

/// Inbound half: yields the payload of each binary message.
pub struct WebSocketSource<S>(SplitStream<WebSocketStream<S>>);

impl<S> core::fmt::Debug for WebSocketSource<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WebSocketSource").finish()
    }
}

#[async_trait]
impl<S> ChunkSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_chunk(&mut self) -> io::Result<Bytes> {
        loop {
            let message = match self.0.next().await {
                None => return Err(ErrorKind::UnexpectedEof.into()),
                Some(Err(e)) => return Err(io::Error::new(ErrorKind::Other, e)),
                Some(Ok(m)) => m,
            };
            match message {
                Message::Binary(b) => return Ok(Bytes::from(b)),
                // Keepalive frames are transparent to the protocol.
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return Err(ErrorKind::UnexpectedEof.into()),
                _ => return Err(TransportError::UnexpectedMessageType.into()),
            }
        }
    }
}

/// Outbound half: wraps each transport write in one binary message.
pub struct WebSocketSink<S>(SplitSink<WebSocketStream<S>, Message>);

impl<S> core::fmt::Debug for WebSocketSink<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WebSocketSink").finish()
    }
}

#[async_trait]
impl<S> MessageSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, b: &[u8]) -> io::Result<()> {
        self.0
            .send(Message::Binary(b.to_vec().into()))
            .await
            .map_err(|e| io::Error::new(ErrorKind::Other, e))
    }
}
