//! Postage stamps.
//!
//! A stamp is a signed witness that the owner of a batch paid for storing a
//! chunk. Its wire form is `batch id || index || timestamp || signature`,
//! 113 bytes, with `index = bucket || counter` as big endian u32s and the
//! timestamp as big endian nanoseconds.

use std::fmt::{self, Debug, Display};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu, ensure};

use crate::{
    address::Address,
    crypto::{self, CryptoError, EthAddress, Signature},
    hash::keccak256,
};

/// Size of a serialized [`Stamp`].
pub const STAMP_SIZE: usize = 32 + 8 + 8 + 65;

/// Identifier of a postage batch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BatchId([u8; 32]);

impl BatchId {
    /// Creates a batch id from raw bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for BatchId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.0, f)
    }
}

impl Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchId({self})")
    }
}

/// Errors from parsing or validating stamps.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum StampError {
    #[snafu(display("invalid stamp: {len} bytes"))]
    StampInvalid { len: usize },
    #[snafu(display("bucket mismatch: stamp bucket {got}, chunk bucket {expected}"))]
    BucketMismatch { expected: u32, got: u32 },
    #[snafu(display("invalid index: counter {counter} exceeds bucket capacity {limit}"))]
    InvalidIndex { counter: u32, limit: u32 },
    #[snafu(display("owner mismatch: signed by {signer}, batch owned by {owner}"))]
    OwnerMismatch { signer: EthAddress, owner: EthAddress },
    #[snafu(display("invalid depth {depth} with bucket depth {bucket_depth}"))]
    InvalidDepth { depth: u8, bucket_depth: u8 },
    #[snafu(display("stamp signature"))]
    Signature { source: CryptoError },
}

/// The batch properties a stamp is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    /// Owner of the batch.
    pub owner: EthAddress,
    /// The batch holds `2^depth` stamps.
    pub depth: u8,
    /// The batch is split into `2^bucket_depth` buckets.
    pub bucket_depth: u8,
    /// Immutable batches never reuse a bucket slot.
    pub immutable: bool,
}

impl BatchInfo {
    /// Number of slots in each bucket, `2^(depth - bucket_depth)`.
    pub fn bucket_upper_bound(&self) -> u32 {
        bucket_upper_bound(self.depth, self.bucket_depth)
    }
}

/// Number of slots in each bucket of a batch, `2^(depth - bucket_depth)`.
pub fn bucket_upper_bound(depth: u8, bucket_depth: u8) -> u32 {
    1u32.checked_shl(u32::from(depth.saturating_sub(bucket_depth)))
        .unwrap_or(u32::MAX)
}

/// The bucket of `addr`: its first `bucket_depth` bits as a big endian u32.
pub fn to_bucket(bucket_depth: u8, addr: &Address) -> u32 {
    if bucket_depth == 0 {
        return 0;
    }
    let bytes = addr.as_bytes();
    let prefix = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    prefix >> (32 - u32::from(bucket_depth.min(32)))
}

/// Encodes a bucket and counter into a stamp index.
pub fn index_to_bytes(bucket: u32, counter: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&bucket.to_be_bytes());
    out[4..].copy_from_slice(&counter.to_be_bytes());
    out
}

/// Decodes a stamp index into bucket and counter.
pub fn bytes_to_index(index: &[u8; 8]) -> (u32, u32) {
    let bucket = u32::from_be_bytes([index[0], index[1], index[2], index[3]]);
    let counter = u32::from_be_bytes([index[4], index[5], index[6], index[7]]);
    (bucket, counter)
}

/// The digest a stamp signs, `keccak256(chunk || batch || index || timestamp)`.
pub fn digest(chunk: &Address, batch_id: &BatchId, index: &[u8; 8], timestamp: &[u8; 8]) -> [u8; 32] {
    keccak256([
        chunk.as_bytes().as_slice(),
        batch_id.as_bytes().as_slice(),
        index.as_slice(),
        timestamp.as_slice(),
    ])
}

/// A postage stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    batch_id: BatchId,
    index: [u8; 8],
    timestamp: [u8; 8],
    signature: Signature,
}

impl Stamp {
    /// Assembles a stamp from its parts.
    pub fn new(batch_id: BatchId, index: [u8; 8], timestamp: [u8; 8], signature: Signature) -> Self {
        Self {
            batch_id,
            index,
            timestamp,
            signature,
        }
    }

    /// The batch the stamp was issued from.
    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    /// The raw index, `bucket || counter`.
    pub fn index(&self) -> &[u8; 8] {
        &self.index
    }

    /// Bucket and counter of the index.
    pub fn bucket_and_counter(&self) -> (u32, u32) {
        bytes_to_index(&self.index)
    }

    /// The raw big endian timestamp.
    pub fn timestamp_bytes(&self) -> &[u8; 8] {
        &self.timestamp
    }

    /// The timestamp in nanoseconds.
    pub fn timestamp(&self) -> u64 {
        u64::from_be_bytes(self.timestamp)
    }

    /// The owner signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Serializes to the 113 byte wire format.
    pub fn to_bytes(&self) -> [u8; STAMP_SIZE] {
        let mut out = [0u8; STAMP_SIZE];
        out[..32].copy_from_slice(self.batch_id.as_bytes());
        out[32..40].copy_from_slice(&self.index);
        out[40..48].copy_from_slice(&self.timestamp);
        out[48..].copy_from_slice(self.signature.as_bytes());
        out
    }

    /// Parses the 113 byte wire format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StampError> {
        ensure!(
            bytes.len() == STAMP_SIZE,
            StampInvalidSnafu { len: bytes.len() }
        );
        let mut batch_id = [0u8; 32];
        batch_id.copy_from_slice(&bytes[..32]);
        let mut index = [0u8; 8];
        index.copy_from_slice(&bytes[32..40]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[40..48]);
        let signature = Signature::from_slice(&bytes[48..]).context(SignatureSnafu)?;
        Ok(Self {
            batch_id: BatchId(batch_id),
            index,
            timestamp,
            signature,
        })
    }

    /// Recovers the address that signed this stamp for `chunk`.
    pub fn signer(&self, chunk: &Address) -> Result<EthAddress, StampError> {
        let digest = digest(chunk, &self.batch_id, &self.index, &self.timestamp);
        crypto::recover_address(&self.signature, &digest).context(SignatureSnafu)
    }

    /// Checks that this stamp was issued for `chunk` by the owner of `batch`
    /// within the bounds of its bucket.
    pub fn valid(&self, chunk: &Address, batch: &BatchInfo) -> Result<(), StampError> {
        ensure!(
            batch.bucket_depth <= batch.depth && batch.bucket_depth <= 32,
            InvalidDepthSnafu {
                depth: batch.depth,
                bucket_depth: batch.bucket_depth
            }
        );
        let signer = self.signer(chunk)?;
        let (bucket, counter) = self.bucket_and_counter();
        let expected = to_bucket(batch.bucket_depth, chunk);
        ensure!(
            bucket == expected,
            BucketMismatchSnafu {
                expected,
                got: bucket
            }
        );
        let limit = batch.bucket_upper_bound();
        ensure!(counter < limit, InvalidIndexSnafu { counter, limit });
        ensure!(
            signer == batch.owner,
            OwnerMismatchSnafu {
                signer,
                owner: batch.owner
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::crypto::Signer;

    fn sign(signer: &Signer, chunk: &Address, batch: BatchId, index: [u8; 8], ts: u64) -> Stamp {
        let timestamp = ts.to_be_bytes();
        let digest = digest(chunk, &batch, &index, &timestamp);
        let sig = signer.sign(&digest).unwrap();
        Stamp::new(batch, index, timestamp, sig)
    }

    fn setup() -> (Signer, BatchInfo, Address) {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let signer = Signer::generate(&mut rng);
        let info = BatchInfo {
            owner: signer.eth_address(),
            depth: 20,
            bucket_depth: 16,
            immutable: false,
        };
        let chunk = Address::new([0xab; 32]);
        (signer, info, chunk)
    }

    #[test]
    fn buckets() {
        let addr = Address::new([0xff; 32]);
        assert_eq!(to_bucket(0, &addr), 0);
        assert_eq!(to_bucket(8, &addr), 0xff);
        assert_eq!(to_bucket(16, &addr), 0xffff);
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1010_0000;
        assert_eq!(to_bucket(3, &Address::new(bytes)), 0b101);
        assert_eq!(bucket_upper_bound(12, 8), 16);
        assert_eq!(bytes_to_index(&index_to_bytes(3, 9)), (3, 9));
    }

    #[test]
    fn wire_roundtrip() {
        let (signer, _, chunk) = setup();
        let stamp = sign(&signer, &chunk, BatchId::new([1; 32]), index_to_bytes(1, 2), 42);
        let bytes = stamp.to_bytes();
        assert_eq!(bytes.len(), STAMP_SIZE);
        assert_eq!(&bytes[40..48], &42u64.to_be_bytes());
        let parsed = Stamp::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, stamp);
        assert_eq!(parsed.timestamp(), 42);
        assert!(matches!(
            Stamp::from_bytes(&bytes[..112]),
            Err(StampError::StampInvalid { .. })
        ));
    }

    #[test]
    fn validation() {
        let (signer, info, chunk) = setup();
        let batch = BatchId::new([1; 32]);
        let bucket = to_bucket(info.bucket_depth, &chunk);

        let good = sign(&signer, &chunk, batch, index_to_bytes(bucket, 3), 1);
        good.valid(&chunk, &info).unwrap();

        let mut flipped = *chunk.as_bytes();
        flipped[0] ^= 0x80;
        let other = Address::new(flipped);
        let stamp = sign(&signer, &other, batch, index_to_bytes(bucket, 3), 1);
        assert!(matches!(
            stamp.valid(&other, &info),
            Err(StampError::BucketMismatch { .. })
        ));

        let stamp = sign(&signer, &chunk, batch, index_to_bytes(bucket, 16), 1);
        assert!(matches!(
            stamp.valid(&chunk, &info),
            Err(StampError::InvalidIndex { .. })
        ));

        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(8);
        let stranger = Signer::generate(&mut rng);
        let stamp = sign(&stranger, &chunk, batch, index_to_bytes(bucket, 3), 1);
        assert!(matches!(
            stamp.valid(&chunk, &info),
            Err(StampError::OwnerMismatch { .. })
        ));
    }
}
