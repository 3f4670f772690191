use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{ready, Stream};
use parking_lot::Mutex;
use pin_project::pin_project;
use sha2::{Digest, Sha256};

use crate::error::StorageError;

#[derive(Default)]
struct HashState {
    hasher: Sha256,
    bytes: u64,
    overflowed: bool,
}

impl fmt::Debug for HashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashState")
            .field("bytes", &self.bytes)
            .field("overflowed", &self.overflowed)
            .finish_non_exhaustive()
    }
}

/// Read side of a [`HashingStream`], usable after the stream is consumed.
#[derive(Debug, Clone)]
pub struct HashHandle {
    state: Arc<Mutex<HashState>>,
}

impl HashHandle {
    /// Bytes observed so far.
    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    /// Returns `true` once the stream yielded more than its byte budget.
    pub fn overflowed(&self) -> bool {
        self.state.lock().overflowed
    }

    /// Hex SHA-256 of the bytes observed so far.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.state.lock().hasher.clone().finalize())
    }
}

/// Stream adapter that hashes chunks as they pass through.
///
/// Yields [`StorageError::SizeMismatch`] and stops forwarding once more
/// than `max_bytes` have been seen.
#[pin_project]
#[derive(Debug)]
pub struct HashingStream<S> {
    #[pin]
    inner: S,
    state: Arc<Mutex<HashState>>,
    max_bytes: u64,
    key: String,
    done: bool,
}

impl<S> HashingStream<S> {
    /// Wraps `inner`, allowing at most `max_bytes` through.
    pub fn new(inner: S, key: impl Into<String>, max_bytes: u64) -> (Self, HashHandle) {
        let state = Arc::new(Mutex::new(HashState::default()));
        let handle = HashHandle {
            state: Arc::clone(&state),
        };
        let stream = Self {
            inner,
            state,
            max_bytes,
            key: key.into(),
            done: false,
        };
        (stream, handle)
    }
}

impl<S> Stream for HashingStream<S>
where
    S: Stream<Item = Result<Bytes, StorageError>>,
{
    type Item = Result<Bytes, StorageError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) => {
                let mut state = this.state.lock();
                state.bytes += chunk.len() as u64;
                if state.bytes > *this.max_bytes {
                    state.overflowed = true;
                    *this.done = true;
                    return Poll::Ready(Some(Err(StorageError::SizeMismatch {
                        key: this.key.clone(),
                        expected: *this.max_bytes,
                        actual: state.bytes,
                    })));
                }
                state.hasher.update(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => Poll::Ready(other),
        }
    }
}

/// Hex SHA-256 of an in-memory payload.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
