//! Streaming compression filter.
//!
//! Wraps a flate2 or zstd codec over an in-memory buffer. Each `process`
//! call pushes bytes in and hands back whatever the codec has emitted so far,
//! which may be nothing while it accumulates context. `finish` flushes the
//! trailing state. Output is the codec's standard container, readable by any
//! decoder for that format.
//!
//! Decoders insist on reaching the end-of-stream marker: a truncated input
//! fails in `finish` instead of yielding a shorter plaintext. A stream that
//! never received input produces no output at all, in both directions.

use bytes::Bytes;
use flate2::write::{DeflateEncoder, GzDecoder, GzEncoder, ZlibEncoder};
use flate2::{Compression, Decompress, FlushDecompress, Status};
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, Write};
use tracing::debug;
use zstd::stream::raw::{InBuffer, Operation, OutBuffer};

use crate::error::StreamError;
use crate::stream::Filter;

/// Default zstd level
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Output reserved per inflate step
const OUTPUT_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    Zlib,
    /// Raw deflate, no container header
    Deflate,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
            Self::Deflate => "deflate",
            Self::Zstd => "zstd",
        }
    }
}

fn truncated() -> io::Error {
    io::Error::new(ErrorKind::UnexpectedEof, "truncated stream")
}

/// zlib or raw deflate decoder that tracks the end-of-stream marker.
struct Inflater {
    raw: Decompress,
    out: Vec<u8>,
    ended: bool,
}

impl Inflater {
    fn new(zlib_header: bool) -> Self {
        Self {
            raw: Decompress::new(zlib_header),
            out: Vec::new(),
            ended: false,
        }
    }

    fn push(&mut self, mut input: &[u8]) -> io::Result<()> {
        loop {
            if self.ended {
                if input.is_empty() {
                    return Ok(());
                }
                return Err(io::Error::new(ErrorKind::InvalidData, "data after end of stream"));
            }

            self.out.reserve(OUTPUT_CHUNK);
            let (in_before, out_before) = (self.raw.total_in(), self.raw.total_out());
            let status = self
                .raw
                .decompress_vec(input, &mut self.out, FlushDecompress::None)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
            let consumed = (self.raw.total_in() - in_before) as usize;
            let produced = self.raw.total_out() - out_before;
            input = &input[consumed..];

            if status == Status::StreamEnd {
                self.ended = true;
            } else if consumed == 0 && produced == 0 {
                if input.is_empty() {
                    return Ok(());
                }
                return Err(io::Error::new(ErrorKind::InvalidData, "inflate made no progress"));
            }
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        if !self.ended {
            return Err(truncated());
        }
        Ok(self.out)
    }
}

/// zstd decoder that remembers whether the last frame was completed.
struct ZstdInflater {
    raw: zstd::stream::raw::Decoder<'static>,
    out: Vec<u8>,
    scratch: Vec<u8>,
    frame_done: bool,
}

impl ZstdInflater {
    fn new() -> io::Result<Self> {
        Ok(Self {
            raw: zstd::stream::raw::Decoder::new()?,
            out: Vec::new(),
            scratch: vec![0u8; OUTPUT_CHUNK],
            frame_done: false,
        })
    }

    fn push(&mut self, data: &[u8]) -> io::Result<()> {
        let mut input = InBuffer::around(data);
        loop {
            let in_before = input.pos();
            let (hint, produced) = {
                let mut output = OutBuffer::around(&mut self.scratch[..]);
                let hint = self.raw.run(&mut input, &mut output)?;
                (hint, output.pos())
            };
            self.out.extend_from_slice(&self.scratch[..produced]);
            // A zero hint means the current frame is fully decoded and flushed
            self.frame_done = hint == 0;

            if input.pos() == data.len() && produced < self.scratch.len() {
                return Ok(());
            }
            if input.pos() == in_before && produced == 0 {
                return Err(io::Error::new(ErrorKind::InvalidData, "zstd made no progress"));
            }
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        if !self.frame_done {
            return Err(truncated());
        }
        Ok(self.out)
    }
}

enum Codec {
    GzipEncoder(GzEncoder<Vec<u8>>),
    GzipDecoder(GzDecoder<Vec<u8>>),
    ZlibEncoder(ZlibEncoder<Vec<u8>>),
    DeflateEncoder(DeflateEncoder<Vec<u8>>),
    /// zlib or raw deflate, per the header flag
    Inflate(Inflater),
    ZstdEncoder(zstd::stream::write::Encoder<'static, Vec<u8>>),
    ZstdDecoder(ZstdInflater),
}

impl Codec {
    fn push(&mut self, input: &[u8]) -> io::Result<()> {
        match self {
            Self::GzipEncoder(c) => c.write_all(input),
            Self::GzipDecoder(c) => c.write_all(input),
            Self::ZlibEncoder(c) => c.write_all(input),
            Self::DeflateEncoder(c) => c.write_all(input),
            Self::Inflate(c) => c.push(input),
            Self::ZstdEncoder(c) => c.write_all(input),
            Self::ZstdDecoder(c) => c.push(input),
        }
    }

    fn output(&mut self) -> &mut Vec<u8> {
        match self {
            Self::GzipEncoder(c) => c.get_mut(),
            Self::GzipDecoder(c) => c.get_mut(),
            Self::ZlibEncoder(c) => c.get_mut(),
            Self::DeflateEncoder(c) => c.get_mut(),
            Self::Inflate(c) => &mut c.out,
            Self::ZstdEncoder(c) => c.get_mut(),
            Self::ZstdDecoder(c) => &mut c.out,
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Self::GzipEncoder(c) => c.finish(),
            Self::GzipDecoder(c) => c.finish(),
            Self::ZlibEncoder(c) => c.finish(),
            Self::DeflateEncoder(c) => c.finish(),
            Self::Inflate(c) => c.finish(),
            Self::ZstdEncoder(c) => c.finish(),
            Self::ZstdDecoder(c) => c.finish(),
        }
    }
}

/// Order-preserving streaming codec wrapper.
pub struct CompressionFilter {
    algorithm: CompressionAlgorithm,
    compressing: bool,
    codec: Codec,
    bytes_in: u64,
    bytes_out: u64,
}

impl std::fmt::Debug for CompressionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionFilter")
            .field("algorithm", &self.algorithm)
            .field("compressing", &self.compressing)
            .field("bytes_in", &self.bytes_in)
            .field("bytes_out", &self.bytes_out)
            .finish()
    }
}

impl CompressionFilter {
    pub fn compress(algorithm: CompressionAlgorithm) -> Result<Self, StreamError> {
        let level = match algorithm {
            CompressionAlgorithm::Zstd => DEFAULT_ZSTD_LEVEL as u32,
            _ => Compression::default().level(),
        };
        Self::compress_with_level(algorithm, level)
    }

    /// `level` is 0-9 for the flate2 formats and 1-22 for zstd.
    pub fn compress_with_level(algorithm: CompressionAlgorithm, level: u32) -> Result<Self, StreamError> {
        let codec = match algorithm {
            CompressionAlgorithm::Gzip => {
                Codec::GzipEncoder(GzEncoder::new(Vec::new(), Compression::new(level.min(9))))
            }
            CompressionAlgorithm::Zlib => {
                Codec::ZlibEncoder(ZlibEncoder::new(Vec::new(), Compression::new(level.min(9))))
            }
            CompressionAlgorithm::Deflate => {
                Codec::DeflateEncoder(DeflateEncoder::new(Vec::new(), Compression::new(level.min(9))))
            }
            CompressionAlgorithm::Zstd => {
                let level = i32::try_from(level).unwrap_or(DEFAULT_ZSTD_LEVEL);
                Codec::ZstdEncoder(
                    zstd::stream::write::Encoder::new(Vec::new(), level)
                        .map_err(|e| codec_error(algorithm, &e))?,
                )
            }
        };
        Ok(Self::with_codec(algorithm, true, codec))
    }

    pub fn decompress(algorithm: CompressionAlgorithm) -> Result<Self, StreamError> {
        let codec = match algorithm {
            CompressionAlgorithm::Gzip => Codec::GzipDecoder(GzDecoder::new(Vec::new())),
            CompressionAlgorithm::Zlib => Codec::Inflate(Inflater::new(true)),
            CompressionAlgorithm::Deflate => Codec::Inflate(Inflater::new(false)),
            CompressionAlgorithm::Zstd => Codec::ZstdDecoder(
                ZstdInflater::new().map_err(|e| codec_error(algorithm, &e))?,
            ),
        };
        Ok(Self::with_codec(algorithm, false, codec))
    }

    fn with_codec(algorithm: CompressionAlgorithm, compressing: bool, codec: Codec) -> Self {
        Self {
            algorithm,
            compressing,
            codec,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    fn take_output(&mut self) -> Bytes {
        let out = Bytes::from(std::mem::take(self.codec.output()));
        self.bytes_out += out.len() as u64;
        out
    }
}

fn codec_error(algorithm: CompressionAlgorithm, err: &io::Error) -> StreamError {
    StreamError::codec(format!("{}: {}", algorithm.name(), err))
}

impl Filter for CompressionFilter {
    fn process(&mut self, input: Bytes) -> Result<Bytes, StreamError> {
        self.codec
            .push(&input)
            .map_err(|e| codec_error(self.algorithm, &e))?;
        self.bytes_in += input.len() as u64;
        Ok(self.take_output())
    }

    fn finish(mut self) -> Result<Option<Bytes>, StreamError> {
        if self.bytes_in == 0 {
            debug!(algorithm = self.algorithm.name(), "empty stream, nothing to flush");
            return Ok(None);
        }

        let mut out = Bytes::from(std::mem::take(self.codec.output()));
        let algorithm = self.algorithm;
        let trailing = self.codec.finish().map_err(|e| codec_error(algorithm, &e))?;
        if !trailing.is_empty() {
            let mut joined = Vec::with_capacity(out.len() + trailing.len());
            joined.extend_from_slice(&out);
            joined.extend_from_slice(&trailing);
            out = Bytes::from(joined);
        }

        debug!(
            algorithm = algorithm.name(),
            compressing = self.compressing,
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out + out.len() as u64,
            "codec finished"
        );
        Ok(Some(out))
    }
}
