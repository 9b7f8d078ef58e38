//! Authenticated block-cipher filter.
//!
//! [`BlockCipherFilter`] seals a sequence of plaintext buffers into boxes,
//! or opens such boxes back into plaintext. Every box is bound to its
//! position in the stream and to whether it is the final box, so reordered,
//! replayed, dropped or truncated boxes fail to open.
//!
//! ## Box Format
//!
//! ```text
//! [nonce:12][ciphertext][tag:16]
//! ```
//!
//! The position is never transmitted. Both ends recompute the associated
//! data from the box ordinal:
//!
//! ```text
//! [index:8 big-endian][final:1]
//! ```
//!
//! Box boundaries on the wire equal the plaintext buffer boundaries used at
//! seal time, so openers must read `box_size + BOX_OVERHEAD` bytes per box.

use aes_gcm::Aes256Gcm;
use bytes::{Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, Nonce, OsRng, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StreamError;
use crate::key::SymmetricKey;
use crate::stream::Filter;

/// Nonce length shared by both algorithms (96 bits)
pub const NONCE_LEN: usize = 12;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// Bytes added to every sealed box
pub const BOX_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Length of the positional associated data
pub const AAD_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherAlgorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }
}

/// Direction and algorithm, fixed at construction.
enum BoxOperation {
    SealAesGcm(Aes256Gcm),
    OpenAesGcm(Aes256Gcm),
    SealChaCha(ChaCha20Poly1305),
    OpenChaCha(ChaCha20Poly1305),
}

/// Streaming seal/open of position-bound boxes.
///
/// Holds one box back so the last one can be marked final when
/// [`Filter::finish`] runs. The key is used unmodified for every box.
pub struct BlockCipherFilter {
    operation: BoxOperation,
    index: u64,
    pending: Option<Bytes>,
}

impl std::fmt::Debug for BlockCipherFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipherFilter")
            .field("algorithm", &self.algorithm())
            .field("sealing", &self.is_sealing())
            .field("index", &self.index)
            .field("pending", &self.pending.as_ref().map(Bytes::len))
            .finish()
    }
}

impl BlockCipherFilter {
    /// Filter turning plaintext buffers into sealed boxes.
    ///
    /// Key length is enforced by [`SymmetricKey`], so construction cannot fail.
    pub fn seal(algorithm: CipherAlgorithm, key: &SymmetricKey) -> Self {
        let operation = match algorithm {
            CipherAlgorithm::Aes256Gcm => {
                BoxOperation::SealAesGcm(Aes256Gcm::new(key.as_bytes().into()))
            }
            CipherAlgorithm::ChaCha20Poly1305 => {
                BoxOperation::SealChaCha(ChaCha20Poly1305::new(key.as_bytes().into()))
            }
        };
        Self::with_operation(operation)
    }

    /// Filter turning sealed boxes back into plaintext buffers.
    pub fn open(algorithm: CipherAlgorithm, key: &SymmetricKey) -> Self {
        let operation = match algorithm {
            CipherAlgorithm::Aes256Gcm => {
                BoxOperation::OpenAesGcm(Aes256Gcm::new(key.as_bytes().into()))
            }
            CipherAlgorithm::ChaCha20Poly1305 => {
                BoxOperation::OpenChaCha(ChaCha20Poly1305::new(key.as_bytes().into()))
            }
        };
        Self::with_operation(operation)
    }

    fn with_operation(operation: BoxOperation) -> Self {
        Self {
            operation,
            index: 0,
            pending: None,
        }
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        match self.operation {
            BoxOperation::SealAesGcm(_) | BoxOperation::OpenAesGcm(_) => CipherAlgorithm::Aes256Gcm,
            BoxOperation::SealChaCha(_) | BoxOperation::OpenChaCha(_) => {
                CipherAlgorithm::ChaCha20Poly1305
            }
        }
    }

    pub fn is_sealing(&self) -> bool {
        matches!(
            self.operation,
            BoxOperation::SealAesGcm(_) | BoxOperation::SealChaCha(_)
        )
    }

    /// Number of boxes released so far, excluding the one held back.
    pub fn boxes_processed(&self) -> u64 {
        self.index
    }

    /// Wire size of a box sealed from `plaintext_len` bytes.
    pub const fn sealed_len(plaintext_len: usize) -> usize {
        plaintext_len + BOX_OVERHEAD
    }

    fn transform(&self, unit: &[u8], final_box: bool) -> Result<Bytes, StreamError> {
        let aad = associated_data(self.index, final_box);
        match &self.operation {
            BoxOperation::SealAesGcm(cipher) => seal_box(cipher, unit, &aad),
            BoxOperation::OpenAesGcm(cipher) => open_box(cipher, unit, &aad),
            BoxOperation::SealChaCha(cipher) => seal_box(cipher, unit, &aad),
            BoxOperation::OpenChaCha(cipher) => open_box(cipher, unit, &aad),
        }
    }
}

impl Filter for BlockCipherFilter {
    fn process(&mut self, input: Bytes) -> Result<Bytes, StreamError> {
        let Some(unit) = self.pending.replace(input) else {
            return Ok(Bytes::new());
        };
        let out = self.transform(&unit, false)?;
        self.index += 1;
        Ok(out)
    }

    fn finish(mut self) -> Result<Option<Bytes>, StreamError> {
        let Some(unit) = self.pending.take() else {
            debug!(algorithm = self.algorithm().name(), "empty stream, no final box");
            return Ok(None);
        };
        let out = self.transform(&unit, true)?;
        debug!(
            algorithm = self.algorithm().name(),
            sealing = self.is_sealing(),
            boxes = self.index + 1,
            "final box processed"
        );
        Ok(Some(out))
    }
}

/// Positional associated data for the box at `index`.
pub fn associated_data(index: u64, final_box: bool) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = u8::from(final_box);
    aad
}

fn seal_box<A: Aead + AeadCore>(cipher: &A, plaintext: &[u8], aad: &[u8]) -> Result<Bytes, StreamError> {
    let nonce = A::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| StreamError::codec(format!("seal failed: {}", e)))?;

    let mut out = BytesMut::with_capacity(nonce.len() + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out.freeze())
}

fn open_box<A: Aead>(cipher: &A, sealed: &[u8], aad: &[u8]) -> Result<Bytes, StreamError> {
    if sealed.len() < BOX_OVERHEAD {
        return Err(StreamError::Authentication);
    }
    let (nonce, body) = sealed.split_at(NONCE_LEN);

    let nonce = Nonce::<A>::from_slice(nonce);

    cipher
        .decrypt(nonce, Payload { msg: body, aad })
        .map(Bytes::from)
        .map_err(|_| StreamError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KEY_LEN;

    const ALGORITHMS: [CipherAlgorithm; 2] =
        [CipherAlgorithm::Aes256Gcm, CipherAlgorithm::ChaCha20Poly1305];

    fn test_key() -> SymmetricKey {
        SymmetricKey::from_slice(&[0x42u8; KEY_LEN]).expect("valid key")
    }

    /// Feeds `units` through `filter`, collecting every non-empty output.
    fn run(mut filter: BlockCipherFilter, units: &[Bytes]) -> Result<Vec<Bytes>, StreamError> {
        let mut out = Vec::new();
        for unit in units {
            let produced = filter.process(unit.clone())?;
            if !produced.is_empty() {
                out.push(produced);
            }
        }
        if let Some(last) = filter.finish()? {
            out.push(last);
        }
        Ok(out)
    }

    fn seal_units(algorithm: CipherAlgorithm, units: &[&[u8]]) -> Vec<Bytes> {
        let units: Vec<Bytes> = units.iter().map(|u| Bytes::copy_from_slice(u)).collect();
        let filter = BlockCipherFilter::seal(algorithm, &test_key());
        run(filter, &units).expect("sealing failed")
    }

    fn open_boxes(algorithm: CipherAlgorithm, boxes: &[Bytes]) -> Result<Vec<Bytes>, StreamError> {
        let filter = BlockCipherFilter::open(algorithm, &test_key());
        run(filter, boxes)
    }

    #[test]
    fn test_round_trip_both_algorithms() {
        for algorithm in ALGORITHMS {
            let units: [&[u8]; 3] = [b"first box", b"second", b"x"];
            let boxes = seal_units(algorithm, &units);
            assert_eq!(boxes.len(), 3);
            for (sealed, plain) in boxes.iter().zip(units) {
                assert_eq!(sealed.len(), plain.len() + BOX_OVERHEAD);
            }

            let opened = open_boxes(algorithm, &boxes).expect("opening failed");
            assert_eq!(opened, units.to_vec());
        }
    }

    #[test]
    fn test_first_process_only_buffers() {
        let mut filter =
            BlockCipherFilter::seal(CipherAlgorithm::Aes256Gcm, &test_key());
        let out = filter.process(Bytes::from_static(b"held")).expect("process");
        assert!(out.is_empty());
        assert_eq!(filter.boxes_processed(), 0);

        let out = filter.process(Bytes::from_static(b"next")).expect("process");
        assert_eq!(out.len(), 4 + BOX_OVERHEAD);
        assert_eq!(filter.boxes_processed(), 1);
    }

    #[test]
    fn test_empty_stream_finishes_with_nothing() {
        for algorithm in ALGORITHMS {
            let filter = BlockCipherFilter::seal(algorithm, &test_key());
            assert_eq!(filter.finish(), Ok(None));
        }
    }

    #[test]
    fn test_empty_unit_still_authenticated() {
        let boxes = seal_units(CipherAlgorithm::ChaCha20Poly1305, &[b""]);
        assert_eq!(boxes[0].len(), BOX_OVERHEAD);
        let opened = open_boxes(CipherAlgorithm::ChaCha20Poly1305, &boxes).expect("open");
        assert_eq!(opened, vec![Bytes::new()]);
    }

    #[test]
    fn test_any_bit_flip_fails() {
        for algorithm in ALGORITHMS {
            let boxes = seal_units(algorithm, &[b"tamper me", b"and me"]);

            for target in 0..boxes.len() {
                for pos in 0..boxes[target].len() {
                    let mut tampered = boxes.clone();
                    let mut raw = tampered[target].to_vec();
                    raw[pos] ^= 0x01;
                    tampered[target] = Bytes::from(raw);

                    assert_eq!(
                        open_boxes(algorithm, &tampered),
                        Err(StreamError::Authentication),
                        "flip at box {} byte {} went unnoticed",
                        target,
                        pos
                    );
                }
            }
        }
    }

    #[test]
    fn test_reordered_boxes_fail() {
        let mut boxes = seal_units(CipherAlgorithm::Aes256Gcm, &[b"one", b"two", b"three"]);
        boxes.swap(0, 1);
        assert_eq!(
            open_boxes(CipherAlgorithm::Aes256Gcm, &boxes),
            Err(StreamError::Authentication)
        );
    }

    #[test]
    fn test_truncated_stream_fails() {
        let boxes = seal_units(CipherAlgorithm::ChaCha20Poly1305, &[b"one", b"two", b"three"]);
        // Dropping the final box makes box 1 the last one, opened as final
        assert_eq!(
            open_boxes(CipherAlgorithm::ChaCha20Poly1305, &boxes[..2]),
            Err(StreamError::Authentication)
        );
        // Dropping the first box shifts every index
        assert_eq!(
            open_boxes(CipherAlgorithm::ChaCha20Poly1305, &boxes[1..]),
            Err(StreamError::Authentication)
        );
    }

    #[test]
    fn test_replayed_box_fails() {
        let mut boxes = seal_units(CipherAlgorithm::Aes256Gcm, &[b"one", b"two"]);
        boxes.insert(1, boxes[0].clone());
        assert_eq!(
            open_boxes(CipherAlgorithm::Aes256Gcm, &boxes),
            Err(StreamError::Authentication)
        );
    }

    #[test]
    fn test_only_last_box_is_final() {
        let boxes = seal_units(CipherAlgorithm::Aes256Gcm, &[b"a", b"b", b"c"]);
        let key = test_key();
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).expect("cipher");

        for (index, sealed) in boxes.iter().enumerate() {
            let last = index == boxes.len() - 1;
            let as_final = open_box(&cipher, sealed, &associated_data(index as u64, true));
            let as_middle = open_box(&cipher, sealed, &associated_data(index as u64, false));
            assert_eq!(as_final.is_ok(), last);
            assert_eq!(as_middle.is_ok(), !last);
        }
    }

    #[test]
    fn test_wrong_key_or_algorithm_fails() {
        let boxes = seal_units(CipherAlgorithm::Aes256Gcm, &[b"secret"]);

        let other = SymmetricKey::from_slice(&[0x24u8; KEY_LEN]).expect("valid key");
        let filter = BlockCipherFilter::open(CipherAlgorithm::Aes256Gcm, &other);
        assert_eq!(run(filter, &boxes), Err(StreamError::Authentication));

        assert_eq!(
            open_boxes(CipherAlgorithm::ChaCha20Poly1305, &boxes),
            Err(StreamError::Authentication)
        );
    }

    #[test]
    fn test_short_box_fails() {
        let short = vec![Bytes::from_static(&[0u8; BOX_OVERHEAD - 1])];
        assert_eq!(
            open_boxes(CipherAlgorithm::ChaCha20Poly1305, &short),
            Err(StreamError::Authentication)
        );
    }

    #[test]
    fn test_nonces_are_fresh() {
        let boxes = seal_units(CipherAlgorithm::ChaCha20Poly1305, &[b"same", b"same"]);
        assert_ne!(boxes[0][..NONCE_LEN], boxes[1][..NONCE_LEN]);
    }

    #[test]
    fn test_associated_data_layout() {
        assert_eq!(
            associated_data(0x0102, true),
            [0, 0, 0, 0, 0, 0, 0x01, 0x02, 1]
        );
        assert_eq!(associated_data(0, false), [0u8; AAD_LEN]);
    }
}
