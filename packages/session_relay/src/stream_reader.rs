//! Byte stream over a source of whole messages.
//!
//! A message longer than the caller's buffer is served across several reads;
//! no new message is fetched while any of it remains. Reads must be
//! serialized (one reader).

use std::future::Future;

/// Yields the next whole message, `None` when nothing is available.
/// End of stream, if the source has one, is an error.
pub trait MessageSource {
    type Error;

    fn next_message(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;
}

pub struct StreamReader<S> {
    source: S,
    leftover: Vec<u8>,
    offset: usize,
}

impl<S: MessageSource> StreamReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            leftover: Vec::new(),
            offset: 0,
        }
    }

    /// Copy up to `buf.len()` bytes into `buf`.
    ///
    /// Returns `Ok(0)` when the source had no message, or delivered an
    /// empty one. Source errors pass through with nothing copied.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, S::Error> {
        if self.buffered().is_empty() {
            self.leftover.clear();
            self.offset = 0;
            match self.source.next_message().await? {
                Some(msg) => self.leftover = msg,
                None => return Ok(0),
            }
        }

        let available = &self.leftover[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;

        if self.offset == self.leftover.len() {
            self.leftover.clear();
            self.offset = 0;
        }
        Ok(n)
    }

    /// Keep reading until `buf` is full or a read yields nothing.
    /// Returns the number of bytes filled.
    pub async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, S::Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Bytes of a previous message not yet handed out.
    pub fn buffered(&self) -> &[u8] {
        &self.leftover[self.offset..]
    }

    pub fn get_ref(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Unwrap the source. Any buffered bytes are lost.
    pub fn into_inner(self) -> S {
        self.source
    }
}
