//! The pipe engine: drains a [`Source`] into a [`Sink`].
//!
//! The engine propagates the first failure from either side, never retries
//! and never closes either endpoint. Callers pick the close order, e.g.
//! source before sink so filter state flushes before the sink finalizes.

use crate::error::StreamError;
use crate::stream::{Sink, Source};
use tracing::{debug, info};

/// Read size used by [`pipe`] (64KB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Copies every buffer from `source` to `sink` until end of stream.
///
/// Returns the number of bytes written to the sink.
pub async fn pipe<S, K>(source: &mut S, sink: &mut K) -> Result<u64, StreamError>
where
    S: Source,
    K: Sink,
{
    pipe_with_buffer_size(source, sink, DEFAULT_BUFFER_SIZE).await
}

/// Like [`pipe`], reading at most `buffer_size` bytes per call.
///
/// Opening a sealed stream needs reads aligned to the sealed box size.
pub async fn pipe_with_buffer_size<S, K>(
    source: &mut S,
    sink: &mut K,
    buffer_size: usize,
) -> Result<u64, StreamError>
where
    S: Source,
    K: Sink,
{
    let mut total_bytes = 0u64;
    let mut buffers = 0u64;

    while let Some(buffer) = source.read(buffer_size).await? {
        if buffer.is_empty() {
            continue;
        }
        let len = buffer.len() as u64;
        sink.write(buffer).await?;
        total_bytes += len;
        buffers += 1;
    }

    debug!(buffers, buffer_size, "source drained");
    info!(bytes = total_bytes, "pipe complete");
    Ok(total_bytes)
}
