//! Asynchronous completion-callback channel over a file descriptor.
//!
//! [`IoChannel`] runs each bounded read or write on tokio's blocking pool
//! and reports progress through a handler invoked on that worker thread:
//!
//! ```text
//! handler(done, data, error_code) -> ControlFlow<()>
//! ```
//!
//! Reads deliver staged bytes in `data`; writes deliver `None`. A non-zero
//! `error_code` always comes with `done == true`. Returning
//! `ControlFlow::Break` from a progress callback stops the operation.
//!
//! ## Watermarks
//!
//! I/O is performed in slices of at most `high_water` bytes. A progress
//! callback fires whenever `low_water` bytes have accumulated since the last
//! one, or `interval` has elapsed, so callers observe cancellation promptly
//! however large the request.

use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::GENERIC_IO_CODE;

/// Default low watermark (8KB)
pub const DEFAULT_LOW_WATER: usize = 8 * 1024;

/// Default high watermark (64KB)
pub const DEFAULT_HIGH_WATER: usize = 64 * 1024;

/// Default forced callback interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_micros(50);

/// Callback tuning for an [`IoChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub low_water: usize,
    pub high_water: usize,
    pub interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            low_water: DEFAULT_LOW_WATER,
            high_water: DEFAULT_HIGH_WATER,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// First asynchronous error seen by any operation; 0 means none.
#[derive(Debug, Default)]
struct ErrorSlot(AtomicI32);

impl ErrorSlot {
    fn record(&self, code: i32) {
        let _ = self
            .0
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire);
    }

    fn get(&self) -> Option<i32> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            code => Some(code),
        }
    }
}

fn error_code(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(GENERIC_IO_CODE)
}

/// Callback-driven byte channel owning one file descriptor.
#[derive(Debug)]
pub struct IoChannel {
    file: Arc<File>,
    config: ChannelConfig,
    errors: Arc<ErrorSlot>,
}

impl IoChannel {
    pub fn new(file: File, config: ChannelConfig) -> Self {
        Self {
            file: Arc::new(file),
            config,
            errors: Arc::default(),
        }
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    /// Reads up to `length` bytes from the current file position.
    ///
    /// The final callback has `done == true`; its data is empty (or `None`)
    /// only when end of file was reached before anything was staged.
    pub fn read<H>(&self, length: usize, handler: H)
    where
        H: FnMut(bool, Option<Bytes>, i32) -> ControlFlow<()> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        let errors = Arc::clone(&self.errors);
        let config = self.config;
        drop(tokio::task::spawn_blocking(move || {
            read_loop(&file, length, &config, &errors, handler);
        }));
    }

    /// Writes all of `data` at the current file position.
    pub fn write<H>(&self, data: Bytes, handler: H)
    where
        H: FnMut(bool, Option<Bytes>, i32) -> ControlFlow<()> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        let errors = Arc::clone(&self.errors);
        let config = self.config;
        drop(tokio::task::spawn_blocking(move || {
            write_loop(&file, data, &config, &errors, handler);
        }));
    }

    /// Tears the channel down, returning the first error any operation hit.
    ///
    /// Operations abandoned mid-flight keep the descriptor alive until their
    /// next callback tells them to stop.
    pub fn close(self) -> Option<i32> {
        let error = self.errors.get();
        match error {
            Some(code) => warn!(code, "channel closed after asynchronous error"),
            None => debug!("channel closed"),
        }
        error
    }
}

fn read_loop<H>(file: &File, length: usize, config: &ChannelConfig, errors: &ErrorSlot, mut handler: H)
where
    H: FnMut(bool, Option<Bytes>, i32) -> ControlFlow<()>,
{
    let slice = length.min(config.high_water).max(1);
    let mut scratch = vec![0u8; slice];
    let mut staged = BytesMut::new();
    let mut remaining = length;
    let mut last_callback = Instant::now();

    loop {
        let want = remaining.min(slice);
        let n = match (&*file).read(&mut scratch[..want]) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                let code = error_code(&err);
                debug!(code, "channel read failed");
                errors.record(code);
                let _ = handler(true, None, code);
                return;
            }
        };
        staged.extend_from_slice(&scratch[..n]);
        remaining -= n;

        if n == 0 || remaining == 0 {
            let _ = handler(true, Some(staged.split().freeze()), 0);
            return;
        }

        if staged.len() >= config.low_water || last_callback.elapsed() >= config.interval {
            last_callback = Instant::now();
            let data = (!staged.is_empty()).then(|| staged.split().freeze());
            if handler(false, data, 0).is_break() {
                return;
            }
        }
    }
}

fn write_loop<H>(file: &File, data: Bytes, config: &ChannelConfig, errors: &ErrorSlot, mut handler: H)
where
    H: FnMut(bool, Option<Bytes>, i32) -> ControlFlow<()>,
{
    let slice = config.high_water.max(1);
    let mut offset = 0;
    let mut since_callback = 0;
    let mut last_callback = Instant::now();

    while offset < data.len() {
        let end = (offset + slice).min(data.len());
        let n = match (&*file).write(&data[offset..end]) {
            Ok(0) => {
                errors.record(GENERIC_IO_CODE);
                let _ = handler(true, None, GENERIC_IO_CODE);
                return;
            }
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                let code = error_code(&err);
                debug!(code, "channel write failed");
                errors.record(code);
                let _ = handler(true, None, code);
                return;
            }
        };
        offset += n;
        since_callback += n;

        if offset < data.len()
            && (since_callback >= config.low_water || last_callback.elapsed() >= config.interval)
        {
            since_callback = 0;
            last_callback = Instant::now();
            if handler(false, None, 0).is_break() {
                return;
            }
        }
    }

    let _ = handler(true, None, 0);
}
