//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use bytes::Bytes;
use futures::Stream;
use rand::{thread_rng, RngCore};
use std::io;
use tokio_util::sync::CancellationToken;

const GENERATOR_CHUNK_SIZE: usize = 4096;

/// Stream of exactly `size` cryptographically-random bytes, produced in
/// small chunks, checking for cancellation before every chunk.
pub fn random_stream(
    size: u64,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + Sync + 'static {
    futures::stream::try_unfold((size, cancel), |(remaining, cancel)| async move {
        if remaining == 0 {
            return Ok::<_, io::Error>(None);
        }

        if cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "operation cancelled",
            ));
        }

        let take = remaining.min(GENERATOR_CHUNK_SIZE as u64) as usize;
        let mut buffer = vec![0u8; take];
        thread_rng().fill_bytes(&mut buffer);

        Ok(Some((Bytes::from(buffer), (remaining - take as u64, cancel))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn stream_yields_exactly_the_requested_size() {
        let mut stream = Box::pin(random_stream(10_000, CancellationToken::new()));

        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= GENERATOR_CHUNK_SIZE);
            total += chunk.len();
        }

        assert_eq!(total, 10_000);
    }

    #[tokio::test]
    async fn empty_stream_for_zero_size() {
        let mut stream = Box::pin(random_stream(0, CancellationToken::new()));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_stream_aborts_before_the_next_chunk() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut stream = Box::pin(random_stream(10_000, cancel));
        assert!(stream.next().await.unwrap().is_err());
    }
}
