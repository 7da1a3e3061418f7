// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default relay chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Pull-based relay of fixed-size chunks from a process's raw output.
///
/// The source is shared behind an async mutex so several relays can be created
/// for one session; they take turns and each chunk goes to exactly one of them.
/// The sequence ends at EOF, on a read error, or when the session is cancelled.
/// A relay never restarts: a consumer that sees the end must start a new
/// session.
#[derive(Debug)]
pub struct ByteRelay<R> {
    source: Arc<Mutex<R>>,
    chunk_size: usize,
    cancel: CancellationToken,
    finished: bool,
}

impl<R> ByteRelay<R>
where
    R: AsyncRead + Unpin,
{
    #[must_use]
    pub fn new(source: Arc<Mutex<R>>, chunk_size: usize, cancel: CancellationToken) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            cancel,
            finished: false,
        }
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next full chunk, or `None` once the sequence has ended.
    ///
    /// A short final chunk is returned only when the source closes mid-chunk.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.finished {
            return None;
        }

        let mut source = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.finished = true;
                return None;
            }
            guard = self.source.lock() => guard,
        };

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;

        while filled < self.chunk_size {
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.finished = true;
                    return None;
                }
                result = source.read(&mut buf[filled..]) => result,
            };

            match result {
                Ok(0) => {
                    debug!("Relay source closed");
                    self.finished = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) => {
                    debug!("Relay read error: {}", e);
                    self.finished = true;
                    break;
                }
            }
        }

        if filled == 0 {
            return None;
        }
        buf.truncate(filled);
        Some(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn relay_over(data: &'static [u8], chunk_size: usize) -> ByteRelay<&'static [u8]> {
        ByteRelay::new(
            Arc::new(Mutex::new(data)),
            chunk_size,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_fixed_size_chunks_then_end() {
        static DATA: [u8; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let mut relay = relay_over(&DATA, 4);

        assert_eq!(relay.next_chunk().await, Some(vec![1, 2, 3, 4]));
        assert_eq!(relay.next_chunk().await, Some(vec![5, 6, 7, 8]));
        assert_eq!(relay.next_chunk().await, Some(vec![9, 10]));
        assert_eq!(relay.next_chunk().await, None);
        assert!(relay.is_finished());
        assert_eq!(relay.next_chunk().await, None);
    }

    #[tokio::test]
    async fn test_empty_source_ends_immediately() {
        let mut relay = relay_over(b"", DEFAULT_CHUNK_SIZE);
        assert_eq!(relay.next_chunk().await, None);
    }

    #[tokio::test]
    async fn test_chunk_assembled_from_short_reads() {
        let (mut writer, reader) = tokio::io::duplex(8);
        let mut relay = ByteRelay::new(Arc::new(Mutex::new(reader)), 6, CancellationToken::new());

        tokio::spawn(async move {
            for part in [&b"ab"[..], b"cd", b"ef", b"gh"] {
                writer.write_all(part).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        assert_eq!(relay.next_chunk().await.as_deref(), Some(&b"abcdef"[..]));
        assert_eq!(relay.next_chunk().await.as_deref(), Some(&b"gh"[..]));
        assert_eq!(relay.next_chunk().await, None);
    }

    #[tokio::test]
    async fn test_cancel_ends_pending_read() {
        let (_writer, reader) = tokio::io::duplex(8);
        let cancel = CancellationToken::new();
        let mut relay = ByteRelay::new(Arc::new(Mutex::new(reader)), 16, cancel.clone());

        let pending = tokio::spawn(async move { relay.next_chunk().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("relay ignored cancellation")
            .unwrap();
        assert_eq!(result, None);
    }
}
