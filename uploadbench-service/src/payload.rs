//! Generated object contents.

use std::pin::Pin;
use std::{io, task};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::ReaderStream;

use crate::progress::ProgressFn;

/// Size of the chunks a payload is streamed in.
const CHUNK_SIZE: usize = 64 * 1024;

/// Randomized contents of an object.
///
/// The contents are produced lazily from a seeded RNG, so arbitrarily large objects can be
/// uploaded without buffering them or writing temporary files. Two payloads created with the same
/// seed and length yield identical bytes.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The number of bytes left to produce.
    len: u64,
    /// The RNG used to fill the payload with random bytes.
    rng: SmallRng,
}

impl Payload {
    /// Creates a payload of `len` bytes from the given seed.
    pub fn new(seed: u64, len: u64) -> Self {
        Self {
            len,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Creates the payload for one part of a multipart upload.
    pub fn for_part(seed: u64, part_number: u32, len: u64) -> Self {
        Self::new(seed ^ (u64::from(part_number) << 32), len)
    }

    /// The number of bytes this payload will yield.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the payload yields no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Converts the payload into a stream of chunks.
    ///
    /// `progress` is called with the cumulative number of bytes after every chunk handed to the
    /// consumer of the stream.
    pub fn into_stream(
        self,
        progress: ProgressFn,
    ) -> impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static {
        let mut consumed = 0u64;
        ReaderStream::with_capacity(self, CHUNK_SIZE).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                consumed += bytes.len() as u64;
                progress(consumed);
            }
            chunk
        })
    }
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len_to_fill = (buf.len() as u64).min(self.len) as usize;

        let fill_buf = &mut buf[..len_to_fill];
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        Ok(len_to_fill)
    }
}

impl AsyncRead for Payload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let len_to_fill = (buf.remaining() as u64).min(self.len) as usize;

        let fill_buf = buf.initialize_unfilled_to(len_to_fill);
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        buf.advance(len_to_fill);

        task::Poll::Ready(Ok(()))
    }
}
