//! File-backed [`Source`] and [`Sink`] over an [`IoChannel`].
//!
//! Each `read`/`write` issues one channel operation and suspends until its
//! continuation is resolved. Resolution happens once: on an error, on the
//! `done` callback, or on cancellation. Cancellation is checked first in
//! every callback, so a cancelled operation never delivers data and never
//! advances the byte counters, even when bytes were already staged.
//!
//! Cancellation never closes the stream; the owner still calls `close`.
//!
//! Dropping an operation's future before it resolves abandons the worker
//! mid-transfer, leaving the file cursor at an unknown position. The stream
//! then rejects every further read and write with
//! [`StreamError::Cancelled`] instead of resuming from wherever the
//! abandoned worker stopped.

use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::ops::ControlFlow;
use std::path::Path;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{ChannelConfig, IoChannel};
use crate::error::{StreamError, GENERIC_IO_CODE};
use crate::stream::{Sink, Source};

type Continuation<T> = Option<oneshot::Sender<Result<T, StreamError>>>;

fn resolve<T>(continuation: &mut Continuation<T>, value: Result<T, StreamError>) {
    if let Some(tx) = continuation.take() {
        let _ = tx.send(value);
    }
}

/// Exclusive owner of one descriptor and its asynchronous channel.
///
/// Implements both [`Source`] and [`Sink`]; at most one read and one write
/// may be in flight, which `&mut self` enforces.
#[derive(Debug)]
pub struct FileStream {
    /// Present iff the stream has not been closed.
    channel: Option<IoChannel>,
    cancel: CancellationToken,
    bytes_read: u64,
    bytes_written: u64,
    eof_delivered: bool,
    /// Set while awaiting a continuation; still set means it was abandoned.
    in_flight: bool,
    close_error: Option<StreamError>,
}

impl FileStream {
    pub fn new(file: File) -> Self {
        Self::with_config(file, ChannelConfig::default())
    }

    pub fn with_config(file: File, config: ChannelConfig) -> Self {
        Self {
            channel: Some(IoChannel::new(file, config)),
            cancel: CancellationToken::new(),
            bytes_read: 0,
            bytes_written: 0,
            eof_delivered: false,
            in_flight: false,
            close_error: None,
        }
    }

    /// Ties operations to the driving task's cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_none()
    }

    /// True once an operation was dropped before it resolved.
    pub fn is_interrupted(&self) -> bool {
        self.in_flight
    }

    fn channel(&self) -> Result<&IoChannel, StreamError> {
        self.channel.as_ref().ok_or(StreamError::Closed)
    }

    fn ensure_idle(&self) -> Result<(), StreamError> {
        if self.in_flight {
            debug!("previous operation was abandoned, file position unknown");
            return Err(StreamError::Cancelled);
        }
        Ok(())
    }

    async fn await_continuation<T>(
        &mut self,
        rx: oneshot::Receiver<Result<T, StreamError>>,
    ) -> Result<T, StreamError> {
        self.in_flight = true;
        let result = rx.await.unwrap_or(Err(StreamError::os(GENERIC_IO_CODE)));
        self.in_flight = false;
        result
    }

    async fn read_buffer(&mut self, max: usize) -> Result<Option<Bytes>, StreamError> {
        self.ensure_idle()?;
        if self.eof_delivered {
            return Err(StreamError::Closed);
        }
        let channel = self.channel()?;
        if max == 0 {
            return Ok(Some(Bytes::new()));
        }

        let (tx, rx) = oneshot::channel();
        let mut continuation: Continuation<Bytes> = Some(tx);
        let mut staged = BytesMut::new();
        let cancel = self.cancel.clone();

        channel.read(max, move |done, data, code| {
            match &continuation {
                Some(tx) if !tx.is_closed() => {}
                _ => return ControlFlow::Break(()),
            }
            if cancel.is_cancelled() {
                resolve(&mut continuation, Err(StreamError::Cancelled));
                return ControlFlow::Break(());
            }
            if code != 0 {
                resolve(&mut continuation, Err(StreamError::os(code)));
                return ControlFlow::Break(());
            }
            if done {
                let data = match data {
                    Some(data) if staged.is_empty() => data,
                    Some(data) => {
                        staged.extend_from_slice(&data);
                        staged.split().freeze()
                    }
                    None => staged.split().freeze(),
                };
                resolve(&mut continuation, Ok(data));
                return ControlFlow::Break(());
            }
            if let Some(data) = data {
                staged.extend_from_slice(&data);
            }
            ControlFlow::Continue(())
        });

        let data = self
            .await_continuation(rx)
            .await
            .inspect_err(|err| debug!(error = %err, max, "file read failed"))?;

        if data.is_empty() {
            debug!(bytes_read = self.bytes_read, "end of file");
            self.eof_delivered = true;
            return Ok(None);
        }
        self.bytes_read += data.len() as u64;
        Ok(Some(data))
    }

    async fn write_buffer(&mut self, buffer: Bytes) -> Result<(), StreamError> {
        self.ensure_idle()?;
        let channel = self.channel()?;
        let len = buffer.len();
        if len == 0 {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let mut continuation: Continuation<()> = Some(tx);
        let cancel = self.cancel.clone();

        channel.write(buffer, move |done, _, code| {
            match &continuation {
                Some(tx) if !tx.is_closed() => {}
                _ => return ControlFlow::Break(()),
            }
            if cancel.is_cancelled() {
                resolve(&mut continuation, Err(StreamError::Cancelled));
                return ControlFlow::Break(());
            }
            if code != 0 {
                resolve(&mut continuation, Err(StreamError::os(code)));
                return ControlFlow::Break(());
            }
            if done {
                resolve(&mut continuation, Ok(()));
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        self.await_continuation(rx)
            .await
            .inspect_err(|err| debug!(error = %err, len, "file write failed"))?;

        self.bytes_written += len as u64;
        Ok(())
    }

    fn close_channel(&mut self) -> Result<(), StreamError> {
        match self.channel.take() {
            Some(channel) => {
                debug!(
                    bytes_read = self.bytes_read,
                    bytes_written = self.bytes_written,
                    "closing file stream"
                );
                if let Some(code) = channel.close() {
                    let err = StreamError::os(code);
                    self.close_error = Some(err.clone());
                    return Err(err);
                }
                Ok(())
            }
            None => self.close_error.clone().map_or(Ok(()), Err),
        }
    }
}

impl Source for FileStream {
    async fn read(&mut self, max: usize) -> Result<Option<Bytes>, StreamError> {
        self.read_buffer(max).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.close_channel()
    }
}

impl Sink for FileStream {
    async fn write(&mut self, buffer: Bytes) -> Result<(), StreamError> {
        self.write_buffer(buffer).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.close_channel()
    }
}

/// Read side of a [`FileStream`].
#[derive(Debug)]
pub struct FileSource {
    stream: FileStream,
}

impl FileSource {
    pub fn new(file: File) -> Self {
        Self {
            stream: FileStream::new(file),
        }
    }

    pub fn with_config(file: File, config: ChannelConfig) -> Self {
        Self {
            stream: FileStream::with_config(file, config),
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        Self::open_with_config(path, ChannelConfig::default()).await
    }

    pub async fn open_with_config(
        path: impl AsRef<Path>,
        config: ChannelConfig,
    ) -> Result<Self, StreamError> {
        let file = tokio::fs::File::open(path.as_ref()).await?.into_std().await;
        Ok(Self::with_config(file, config))
    }

    pub fn with_cancellation(self, token: CancellationToken) -> Self {
        Self {
            stream: self.stream.with_cancellation(token),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.stream.cancellation_token()
    }

    pub fn bytes_read(&self) -> u64 {
        self.stream.bytes_read()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    pub fn is_interrupted(&self) -> bool {
        self.stream.is_interrupted()
    }
}

impl Source for FileSource {
    async fn read(&mut self, max: usize) -> Result<Option<Bytes>, StreamError> {
        self.stream.read_buffer(max).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.stream.close_channel()
    }
}

/// Write side of a [`FileStream`].
#[derive(Debug)]
pub struct FileSink {
    stream: FileStream,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        Self {
            stream: FileStream::new(file),
        }
    }

    pub fn with_config(file: File, config: ChannelConfig) -> Self {
        Self {
            stream: FileStream::with_config(file, config),
        }
    }

    /// Creates (or truncates) the file at `path`.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        Self::create_with_config(path, ChannelConfig::default()).await
    }

    pub async fn create_with_config(
        path: impl AsRef<Path>,
        config: ChannelConfig,
    ) -> Result<Self, StreamError> {
        let file = tokio::fs::File::create(path.as_ref()).await?.into_std().await;
        Ok(Self::with_config(file, config))
    }

    pub fn with_cancellation(self, token: CancellationToken) -> Self {
        Self {
            stream: self.stream.with_cancellation(token),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.stream.cancellation_token()
    }

    pub fn bytes_written(&self) -> u64 {
        self.stream.bytes_written()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    pub fn is_interrupted(&self) -> bool {
        self.stream.is_interrupted()
    }
}

impl Sink for FileSink {
    async fn write(&mut self, buffer: Bytes) -> Result<(), StreamError> {
        self.stream.write_buffer(buffer).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.stream.close_channel()
    }
}
