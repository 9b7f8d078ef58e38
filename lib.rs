//! # bytepipe - Composable Byte Streams
//!
//! bytepipe chains byte producers ([`Source`]), consumers ([`Sink`]) and
//! transforms ([`Filter`]) into pipes, with file endpoints and
//! authenticated-encryption and compression filters.
//!
//! ## Features
//!
//! - **Pipe engine**: drains a source into a sink, first failure wins, no retry
//! - **File streams**: async reads/writes over a callback-driven channel with
//!   watermark tuning for prompt cooperative cancellation
//! - **Block cipher filter**: AES-256-GCM or ChaCha20-Poly1305 boxes bound to
//!   their position and finality, so reordering and truncation are detected
//! - **Compression filter**: gzip, zlib, raw deflate or zstd streaming codecs
//!
//! ## Quick Start
//!
//! ```no_run
//! use bytepipe::{
//!     pipe, BlockCipherFilter, CipherAlgorithm, FileSink, FileSource, FilteredSource,
//!     Sink, Source, SymmetricKey,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let key = SymmetricKey::load_or_create("./stream.key").await?;
//!
//!     let filter = BlockCipherFilter::seal(CipherAlgorithm::ChaCha20Poly1305, &key);
//!     let mut source = FilteredSource::new(FileSource::open("plain.txt").await?, filter);
//!     let mut sink = FileSink::create("sealed.bin").await?;
//!
//!     pipe(&mut source, &mut sink).await?;
//!
//!     // Close the source first so the final box is flushed
//!     source.close().await?;
//!     sink.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Framing
//!
//! Sealed boxes carry no length field. Seal with a fixed read size and open
//! with [`pipe_with_buffer_size`] using that size plus [`BOX_OVERHEAD`]
//! (see [`StreamConfig::sealed_box_size`]).

pub mod channel;
pub mod cipher_filter;
pub mod compression_filter;
pub mod config;
pub mod error;
pub mod file_stream;
pub mod key;
pub mod pipe;
pub mod stream;

// Re-export common types for convenience
pub use channel::ChannelConfig;
pub use cipher_filter::{BlockCipherFilter, CipherAlgorithm, BOX_OVERHEAD};
pub use compression_filter::{CompressionAlgorithm, CompressionFilter};
pub use config::StreamConfig;
pub use error::StreamError;
pub use file_stream::{FileSink, FileSource, FileStream};
pub use key::SymmetricKey;
pub use pipe::{pipe, pipe_with_buffer_size};
pub use stream::{Filter, FilteredSink, FilteredSource, Sink, Source};
