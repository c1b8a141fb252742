//! The AEAD envelope carrying application frames over a message
//! transport.
//!
//! Wire layout, one or more frames per binary message:
//!
//! ```text
//! | ciphertext_len | ciphertext             |
//! |  2B big-endian | 1..=4096, tag included |
//! ```
//!
//! The session opens with a plaintext nonce exchange: the client's
//! first 12 bytes become the server's read nonce, and the server
//! answers with 12 plaintext bytes of write nonce. Every subsequent
//! frame is sealed with AES-128-GCM under the time-bucketed transport
//! key, each direction advancing its own counter nonce per frame.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use rand::{rngs::OsRng, TryRngCore};

use crate::{
    crypto::{DirectionCipher, TransportKey},
    error::TransportError,
    fetch::{ChunkSource, FetchReader},
    spec::{NONCE_LEN, PLAINTEXT_MAX_LEN, WIRE_FRAME_MAX_LEN, WIRE_LEN_PREFIX},
};

/// Sends one binary message to the peer.
#[async_trait]
pub trait MessageSink: Send {
    /// Delivers `b` as a single message.
    async fn send(&mut self, b: &[u8]) -> io::Result<()>;
}

/// Performs the plaintext nonce exchange and returns the two transport
/// halves.
///
/// `messages` yields inbound binary messages; `sink` delivers outbound
/// ones. The same `key` seeds both directions, but each direction gets
/// its own cipher object so no AEAD state crosses tasks.
pub async fn establish(
    messages: Box<dyn ChunkSource>,
    mut sink: Box<dyn MessageSink>,
    key: &TransportKey,
) -> io::Result<(FrameOpener, FrameSealer)> {
    let mut reader = FetchReader::new(messages);

    let mut read_nonce = [0u8; NONCE_LEN];
    reader
        .read_exact(&mut read_nonce)
        .await
        .map_err(|_| TransportError::NonceExchangeFailed)?;

    let mut write_nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut write_nonce)
        .expect("system random source failure");
    sink.send(&write_nonce).await?;

    Ok((
        FrameOpener {
            wire: reader,
            cipher: DirectionCipher::new(key, read_nonce),
        },
        FrameSealer {
            sink,
            cipher: DirectionCipher::new(key, write_nonce),
        },
    ))
}

/// The read half: decrypts one wire frame per fetch.
///
/// `FrameOpener` is itself a [`ChunkSource`], so the session's
/// [`FetchReader`] can sit directly on top of it and see a plain byte
/// stream of application frames.
#[derive(Debug)]
pub struct FrameOpener {
    wire: FetchReader,
    cipher: DirectionCipher,
}

#[async_trait]
impl ChunkSource for FrameOpener {
    async fn next_chunk(&mut self) -> io::Result<Bytes> {
        // The length prefix stays in the clear and may straddle
        // message boundaries.
        let mut prefix = [0u8; WIRE_LEN_PREFIX];
        self.wire.read_exact(&mut prefix).await?;
        let len = u16::from_be_bytes(prefix);

        if len == 0 || usize::from(len) > WIRE_FRAME_MAX_LEN {
            return Err(TransportError::InvalidDataPackage { received: len }.into());
        }

        let ciphertext = if usize::from(len) <= self.wire.remain() {
            self.wire.export(usize::from(len))?
        } else {
            let mut buf = vec![0u8; usize::from(len)];
            self.wire.read_exact(&mut buf).await?;
            Bytes::from(buf)
        };

        let plaintext = self.cipher.open(&ciphertext)?;
        Ok(Bytes::from(plaintext))
    }
}

/// Writes one plaintext application frame to the peer.
///
/// The session sender only sees this boundary; [`FrameSealer`] is the
/// production implementation.
#[async_trait]
pub trait FrameWrite: Send {
    /// Delivers `plaintext` to the peer as a whole.
    async fn write_frame(&mut self, plaintext: &[u8]) -> io::Result<()>;
}

/// The write half: seals plaintext into length-prefixed wire frames,
/// segmenting whatever does not fit one frame.
pub struct FrameSealer {
    sink: Box<dyn MessageSink>,
    cipher: DirectionCipher,
}

#[async_trait]
impl FrameWrite for FrameSealer {
    /// Seals and sends `plaintext`, splitting it across maximum-size
    /// frames as needed. Each call delivers at least the bytes it was
    /// given; a zero-length call delivers nothing.
    async fn write_frame(&mut self, plaintext: &[u8]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(WIRE_LEN_PREFIX + WIRE_FRAME_MAX_LEN);
        for segment in plaintext.chunks(PLAINTEXT_MAX_LEN) {
            let sealed = self.cipher.seal(segment);
            buf.clear();
            buf.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
            buf.extend_from_slice(&sealed);
            self.sink.send(&buf).await?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for FrameSealer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameSealer")
            .field("cipher", &self.cipher)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{error, fetch::test::ChainSource, spec::TAG_LEN};

    /// A sink recording every sent message.
    #[derive(Clone, Default)]
    pub(crate) struct RecordSink(pub(crate) Arc<Mutex<Vec<Vec<u8>>>>);

    #[async_trait]
    impl MessageSink for RecordSink {
        async fn send(&mut self, b: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().push(b.to_vec());
            Ok(())
        }
    }

    fn key() -> TransportKey {
        TransportKey::from([0x42u8; 16])
    }

    /// Seals `plaintext` the way a client would, with the given write
    /// nonce, producing wire messages.
    fn client_seal(nonce: [u8; 12], frames: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut cipher = DirectionCipher::new(&key(), nonce);
        frames
            .iter()
            .map(|pt| {
                let sealed = cipher.seal(pt);
                let mut msg = (sealed.len() as u16).to_be_bytes().to_vec();
                msg.extend_from_slice(&sealed);
                msg
            })
            .collect()
    }

    async fn establish_server(
        client_messages: Vec<Vec<u8>>,
    ) -> (FrameOpener, FrameSealer, RecordSink) {
        let sink = RecordSink::default();
        let (opener, sealer) = establish(
            Box::new(ChainSource::new(client_messages)),
            Box::new(sink.clone()),
            &key(),
        )
        .await
        .unwrap();
        (opener, sealer, sink)
    }

    #[tokio::test]
    async fn test_handshake_replies_write_nonce() {
        let client_nonce = [7u8; 12];
        let (_, _, sink) = establish_server(vec![client_nonce.to_vec()]).await;
        let sent = sink.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), NONCE_LEN);
    }

    #[tokio::test]
    async fn test_open_client_frames() {
        let client_nonce = [7u8; 12];
        let mut messages = vec![client_nonce.to_vec()];
        messages.extend(client_seal(client_nonce, &[b"hello", b"world"]));

        let (mut opener, _, _) = establish_server(messages).await;
        assert_eq!(&opener.next_chunk().await.unwrap()[..], b"hello");
        assert_eq!(&opener.next_chunk().await.unwrap()[..], b"world");
    }

    #[tokio::test]
    async fn test_open_frame_split_across_messages() {
        let client_nonce = [1u8; 12];
        let wire = client_seal(client_nonce, &[b"split me"]).remove(0);

        // Nonce, then the frame delivered byte by byte.
        let mut messages = vec![client_nonce.to_vec()];
        messages.extend(wire.iter().map(|&b| vec![b]));

        let (mut opener, _, _) = establish_server(messages).await;
        assert_eq!(&opener.next_chunk().await.unwrap()[..], b"split me");
    }

    #[tokio::test]
    async fn test_open_rejects_zero_length() {
        let (mut opener, _, _) =
            establish_server(vec![vec![0u8; 12], vec![0x00, 0x00]]).await;
        let err = opener.next_chunk().await.unwrap_err();
        let err = err.downcast::<error::Error>().unwrap();
        assert_eq!(
            err,
            error::Error::Transport(TransportError::InvalidDataPackage { received: 0 })
        );
    }

    #[tokio::test]
    async fn test_open_rejects_oversize_length() {
        let (mut opener, _, _) =
            establish_server(vec![vec![0u8; 12], vec![0xff, 0xff]]).await;
        assert!(opener.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn test_open_rejects_tampered_frame() {
        let client_nonce = [2u8; 12];
        let mut wire = client_seal(client_nonce, &[b"payload"]).remove(0);
        let last = wire.len() - 1;
        wire[last] = wire[last].wrapping_add(1);

        let (mut opener, _, _) = establish_server(vec![client_nonce.to_vec(), wire]).await;
        assert!(opener.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn test_sealer_segments_large_writes() {
        let (_, mut sealer, sink) = establish_server(vec![vec![0u8; 12]]).await;
        let write_nonce: [u8; 12] = sink.0.lock().unwrap()[0][..].try_into().unwrap();

        let payload = vec![0xabu8; PLAINTEXT_MAX_LEN * 2 + 10];
        sealer.write_frame(&payload).await.unwrap();

        let sent = sink.0.lock().unwrap().clone();
        // Handshake reply plus three sealed segments.
        assert_eq!(sent.len(), 4);

        let mut mirror = DirectionCipher::new(&key(), write_nonce);
        let mut reassembled = Vec::new();
        for msg in &sent[1..] {
            let len = usize::from(u16::from_be_bytes([msg[0], msg[1]]));
            assert!(len <= WIRE_FRAME_MAX_LEN);
            assert_eq!(len, msg.len() - WIRE_LEN_PREFIX);
            assert!(len - TAG_LEN <= PLAINTEXT_MAX_LEN);
            reassembled.extend_from_slice(&mirror.open(&msg[2..]).unwrap());
        }
        assert_eq!(reassembled, payload);
    }
}
