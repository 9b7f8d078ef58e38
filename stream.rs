//! Source, Sink and Filter contracts and their composition.
//!
//! A [`Source`] is pulled for buffers until it returns `None`, a [`Sink`]
//! is pushed buffers one at a time, and a [`Filter`] transforms buffers with
//! a one-unit delay so it can mark the true last unit when [`Filter::finish`]
//! runs. [`FilteredSource`] and [`FilteredSink`] chain a filter in front of
//! or behind an endpoint.
//!
//! All methods take `&mut self`: one instance serves one task at a time and
//! no internal locking is provided.

use crate::error::StreamError;
use bytes::Bytes;
use tracing::{debug, warn};

/// Pull-based byte producer.
#[trait_variant::make(Send)]
pub trait Source: Send {
    /// Returns the next buffer (at most `max` bytes for leaf sources) or
    /// `None` exactly once at end of stream.
    ///
    /// Calls after `None` or after `close` fail with [`StreamError::Closed`].
    async fn read(&mut self, max: usize) -> Result<Option<Bytes>, StreamError>;

    /// Idempotent; replays any remembered asynchronous error on later calls.
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Push-based byte consumer.
#[trait_variant::make(Send)]
pub trait Sink: Send {
    /// Consumes `buffer` fully or fails.
    async fn write(&mut self, buffer: Bytes) -> Result<(), StreamError>;

    /// Idempotent; replays any remembered asynchronous error on later calls.
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Stateful transform with a one-unit delay.
///
/// An instance covers exactly one traversal: `finish` consumes it.
pub trait Filter: Send + Sized {
    /// Accepts the next unit and returns the transform of the previous one
    /// (empty on the first call, or whenever nothing is ready yet).
    fn process(&mut self, input: Bytes) -> Result<Bytes, StreamError>;

    /// Transforms whatever is still carried as the final unit.
    ///
    /// Returns `None` when the stream was empty.
    fn finish(self) -> Result<Option<Bytes>, StreamError>;
}

enum Phase<F> {
    Streaming(F),
    Drained,
    Ended,
    /// The filter rejected the stream; every later read replays this error
    Failed(StreamError),
}

/// A [`Source`] whose buffers pass through a [`Filter`].
///
/// Transformed units are emitted whole, so a single read may return more
/// than `max` bytes when the filter expands its input.
pub struct FilteredSource<S, F> {
    inner: S,
    phase: Phase<F>,
    closed: bool,
}

impl<S: Source, F: Filter> FilteredSource<S, F> {
    pub fn new(inner: S, filter: F) -> Self {
        Self {
            inner,
            phase: Phase::Streaming(filter),
            closed: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Source, F: Filter> Source for FilteredSource<S, F> {
    async fn read(&mut self, max: usize) -> Result<Option<Bytes>, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }

        loop {
            let filter = match &mut self.phase {
                Phase::Streaming(filter) => filter,
                Phase::Drained => {
                    self.phase = Phase::Ended;
                    return Ok(None);
                }
                Phase::Ended => return Err(StreamError::Closed),
                Phase::Failed(err) => return Err(err.clone()),
            };

            let transformed = match self.inner.read(max).await? {
                Some(buffer) => filter.process(buffer).map(Some),
                None => match std::mem::replace(&mut self.phase, Phase::Drained) {
                    Phase::Streaming(filter) => filter.finish(),
                    _ => Ok(None),
                },
            };

            match transformed {
                Ok(Some(out)) if !out.is_empty() => return Ok(Some(out)),
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "filter failed, source is now unusable");
                    self.phase = Phase::Failed(err.clone());
                    return Err(err);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.closed = true;
        self.inner.close().await
    }
}

/// A [`Sink`] that feeds every buffer through a [`Filter`] before writing.
///
/// `close` runs the filter's finishing step exactly once, writes its output
/// and then closes the inner sink.
pub struct FilteredSink<K, F> {
    inner: K,
    filter: Option<F>,
    closed: bool,
    close_error: Option<StreamError>,
}

impl<K: Sink, F: Filter> FilteredSink<K, F> {
    pub fn new(inner: K, filter: F) -> Self {
        Self {
            inner,
            filter: Some(filter),
            closed: false,
            close_error: None,
        }
    }

    pub fn get_ref(&self) -> &K {
        &self.inner
    }

    pub fn into_inner(self) -> K {
        self.inner
    }

    async fn flush(&mut self) -> Result<(), StreamError> {
        let Some(filter) = self.filter.take() else {
            return Ok(());
        };
        if let Some(out) = filter.finish()? {
            if !out.is_empty() {
                debug!(bytes = out.len(), "flushing final filter output");
                self.inner.write(out).await?;
            }
        }
        Ok(())
    }
}

impl<K: Sink, F: Filter> Sink for FilteredSink<K, F> {
    async fn write(&mut self, buffer: Bytes) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        let filter = self.filter.as_mut().ok_or(StreamError::Closed)?;
        let out = filter.process(buffer)?;
        if out.is_empty() {
            return Ok(());
        }
        self.inner.write(out).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return self.close_error.clone().map_or(Ok(()), Err);
        }
        self.closed = true;

        let flushed = self.flush().await;
        let closed = self.inner.close().await;
        if let Err(err) = flushed.and(closed) {
            warn!(error = %err, "filtered sink failed to close cleanly");
            self.close_error = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory endpoints for exercising the contracts without files.

    use super::*;
    use std::collections::VecDeque;

    pub struct MemorySource {
        chunks: VecDeque<Bytes>,
        ended: bool,
        closed: bool,
    }

    impl MemorySource {
        pub fn new<I: IntoIterator<Item = &'static [u8]>>(chunks: I) -> Self {
            Self {
                chunks: chunks.into_iter().map(Bytes::from_static).collect(),
                ended: false,
                closed: false,
            }
        }

        /// Splits `data` into `chunk`-sized buffers.
        pub fn chunked(data: &[u8], chunk: usize) -> Self {
            Self {
                chunks: data.chunks(chunk).map(Bytes::copy_from_slice).collect(),
                ended: false,
                closed: false,
            }
        }
    }

    impl Source for MemorySource {
        async fn read(&mut self, max: usize) -> Result<Option<Bytes>, StreamError> {
            if self.closed || self.ended {
                return Err(StreamError::Closed);
            }
            match self.chunks.pop_front() {
                Some(mut chunk) if chunk.len() > max => {
                    let head = chunk.split_to(max);
                    self.chunks.push_front(chunk);
                    Ok(Some(head))
                }
                Some(chunk) => Ok(Some(chunk)),
                None => {
                    self.ended = true;
                    Ok(None)
                }
            }
        }

        async fn close(&mut self) -> Result<(), StreamError> {
            self.closed = true;
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemorySink {
        pub writes: Vec<Bytes>,
        pub closes: usize,
        pub fail_writes: Option<StreamError>,
    }

    impl MemorySink {
        pub fn concat(&self) -> Vec<u8> {
            self.writes.iter().flat_map(|b| b.iter().copied()).collect()
        }
    }

    impl Sink for MemorySink {
        async fn write(&mut self, buffer: Bytes) -> Result<(), StreamError> {
            if let Some(err) = &self.fail_writes {
                return Err(err.clone());
            }
            self.writes.push(buffer);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), StreamError> {
            self.closes += 1;
            Ok(())
        }
    }

    /// Tags every unit with its position and marks the final one.
    #[derive(Default)]
    pub struct TaggingFilter {
        pending: Option<Bytes>,
        index: u8,
    }

    impl TaggingFilter {
        fn tag(&self, unit: Bytes, last: bool) -> Bytes {
            let mut out = unit.to_vec();
            out.push(b'0' + self.index);
            if last {
                out.push(b'!');
            }
            Bytes::from(out)
        }
    }

    impl Filter for TaggingFilter {
        fn process(&mut self, input: Bytes) -> Result<Bytes, StreamError> {
            match self.pending.replace(input) {
                Some(prev) => {
                    let out = self.tag(prev, false);
                    self.index += 1;
                    Ok(out)
                }
                None => Ok(Bytes::new()),
            }
        }

        fn finish(mut self) -> Result<Option<Bytes>, StreamError> {
            Ok(self.pending.take().map(|unit| self.tag(unit, true)))
        }
    }
}
