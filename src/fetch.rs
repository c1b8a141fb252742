//! Chunked byte-stream abstraction over the decrypted frame source.
//!
//! The transport yields plaintext as arbitrarily-sized chunks, one per
//! AEAD frame. [`FetchReader`] turns that into a lazy byte stream:
//! `fetch` hands out slices of the current chunk without copying and
//! refills from the source only when the chunk is exhausted.
//! [`LimitedReader`] caps a reader at a declared per-frame byte budget
//! and knows when it is complete.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ProtocolError;

/// Produces the next chunk of plaintext bytes.
///
/// A returned error ends the session; an empty chunk is allowed and
/// simply fetched over.
#[async_trait]
pub trait ChunkSource: Send {
    /// Fetches the next chunk from the source.
    async fn next_chunk(&mut self) -> io::Result<Bytes>;
}

/// Reads lazily from a [`ChunkSource`], serving sub-chunk slices
/// without copying.
pub struct FetchReader {
    source: Box<dyn ChunkSource>,
    chunk: Bytes,
}

impl FetchReader {
    /// Creates a new `FetchReader` over `source`.
    pub fn new(source: Box<dyn ChunkSource>) -> Self {
        Self {
            source,
            chunk: Bytes::new(),
        }
    }

    /// How many bytes are buffered and readable without touching the
    /// source.
    pub fn remain(&self) -> usize {
        self.chunk.len()
    }

    /// Takes exactly `n` bytes out of the buffered chunk, never
    /// touching the source.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NotEnoughBuffer`] when fewer than `n`
    /// bytes are buffered; the internal state is left unchanged.
    pub fn export(&mut self, n: usize) -> io::Result<Bytes> {
        if n > self.chunk.len() {
            return Err(ProtocolError::NotEnoughBuffer.into());
        }
        Ok(self.chunk.split_to(n))
    }

    /// Fetches up to `n` bytes, refilling from the source when the
    /// buffered chunk is exhausted.
    ///
    /// The returned slice may be empty when the source produced an
    /// empty chunk.
    pub async fn fetch(&mut self, n: usize) -> io::Result<Bytes> {
        if self.chunk.is_empty() {
            self.chunk = self.source.next_chunk().await?;
        }
        let k = n.min(self.chunk.len());
        Ok(self.chunk.split_to(k))
    }

    /// Fetches exactly one byte, retrying over empty chunks.
    pub async fn fetch_one_byte(&mut self) -> io::Result<u8> {
        loop {
            let d = self.fetch(1).await?;
            if let Some(&b) = d.first() {
                return Ok(b);
            }
        }
    }

    /// Fills `buf` completely.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let d = self.fetch(buf.len() - filled).await?;
            buf[filled..filled + d.len()].copy_from_slice(&d);
            filled += d.len();
        }
        Ok(())
    }
}

impl core::fmt::Debug for FetchReader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FetchReader")
            .field("remain", &self.remain())
            .finish()
    }
}

/// A view over a [`FetchReader`] limited to a declared byte budget.
#[derive(Debug)]
pub struct LimitedReader<'a> {
    r: &'a mut FetchReader,
    n: usize,
}

impl<'a> LimitedReader<'a> {
    /// Creates a reader that serves at most `n` bytes from `r`.
    pub fn new(r: &'a mut FetchReader, n: usize) -> Self {
        Self { r, n }
    }

    /// How many budgeted bytes are still unread.
    pub fn remains(&self) -> usize {
        self.n
    }

    /// Whether the budget has been fully consumed.
    pub fn completed(&self) -> bool {
        self.n == 0
    }

    /// Fetches up to `n` bytes within the budget.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` once the reader is completed.
    pub async fn fetch(&mut self, n: usize) -> io::Result<Bytes> {
        if self.completed() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let d = self.r.fetch(n.min(self.n)).await?;
        self.n -= d.len();
        Ok(d)
    }

    /// Fetches whatever remains of the budget, one chunk at a time.
    pub async fn buffered(&mut self) -> io::Result<Bytes> {
        self.fetch(self.n).await
    }

    /// Fetches exactly one budgeted byte, retrying over empty chunks.
    pub async fn fetch_one_byte(&mut self) -> io::Result<u8> {
        loop {
            let d = self.fetch(1).await?;
            if let Some(&b) = d.first() {
                return Ok(b);
            }
        }
    }

    /// Fills `buf` completely from the budget.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let d = self.fetch(buf.len() - filled).await?;
            buf[filled..filled + d.len()].copy_from_slice(&d);
            filled += d.len();
        }
        Ok(())
    }

    /// Reads into `buf` until the budget is consumed, returning how
    /// many bytes were written.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NotEnoughBuffer`] when `buf` fills up
    /// before the reader completes.
    pub async fn read_until_completed(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while !self.completed() {
            if filled >= buf.len() {
                return Err(ProtocolError::NotEnoughBuffer.into());
            }
            let d = self.fetch(buf.len() - filled).await?;
            buf[filled..filled + d.len()].copy_from_slice(&d);
            filled += d.len();
        }
        Ok(filled)
    }

    /// Discards everything left of the budget.
    pub async fn ditch(&mut self) -> io::Result<()> {
        while !self.completed() {
            self.fetch(self.n).await?;
        }
        Ok(())
    }
}
