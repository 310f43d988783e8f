//! The chunk type and the size constants of the chunk format.

use bytes::Bytes;

use crate::{address::Address, stamp::Stamp};

/// Maximum number of data bytes in a chunk.
pub const CHUNK_SIZE: usize = 4096;
/// Size of the little endian span header preceding chunk data.
pub const SPAN_SIZE: usize = 8;
/// Maximum payload size of a content addressed chunk.
pub const CHUNK_WITH_SPAN_SIZE: usize = CHUNK_SIZE + SPAN_SIZE;
/// Size of a reference to an unencrypted chunk.
pub const HASH_SIZE: usize = crate::hash::HASH_SIZE;
/// Size of the symmetric key appended to encrypted references.
pub const KEY_LENGTH: usize = 32;
/// Size of a reference to an encrypted chunk.
pub const ENCRYPTED_REFERENCE_SIZE: usize = HASH_SIZE + KEY_LENGTH;
/// Branching factor of the trie for unencrypted content.
pub const BRANCHES: usize = CHUNK_SIZE / HASH_SIZE;
/// Branching factor of the trie for encrypted content.
pub const ENCRYPTED_BRANCHES: usize = CHUNK_SIZE / ENCRYPTED_REFERENCE_SIZE;
/// Size of a recoverable secp256k1 signature.
pub const SOC_SIGNATURE_SIZE: usize = 65;
/// Minimum payload size of a single owner chunk.
pub const SOC_MIN_CHUNK_SIZE: usize = HASH_SIZE + SOC_SIGNATURE_SIZE + SPAN_SIZE;
/// Maximum payload size of a single owner chunk.
pub const SOC_MAX_CHUNK_SIZE: usize = SOC_MIN_CHUNK_SIZE + CHUNK_SIZE;

/// Opaque identifier of an upload session.
pub type TagId = u32;

/// A chunk: an address and the payload stored under it.
///
/// For content addressed chunks the payload is `span || data`. Single owner
/// chunks wrap such a payload behind their id and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    address: Address,
    data: Bytes,
    stamp: Option<Stamp>,
    tag_id: Option<TagId>,
}

impl Chunk {
    /// Creates a chunk without a stamp.
    pub fn new(address: Address, data: impl Into<Bytes>) -> Self {
        Self {
            address,
            data: data.into(),
            stamp: None,
            tag_id: None,
        }
    }

    /// Attaches a postage stamp.
    pub fn with_stamp(mut self, stamp: Stamp) -> Self {
        self.stamp = Some(stamp);
        self
    }

    /// Attaches an upload tag.
    pub fn with_tag_id(mut self, tag_id: TagId) -> Self {
        self.tag_id = Some(tag_id);
        self
    }

    /// The chunk address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The full payload including the span header.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The attached stamp, if any.
    pub fn stamp(&self) -> Option<&Stamp> {
        self.stamp.as_ref()
    }

    /// The attached upload tag, if any.
    pub fn tag_id(&self) -> Option<TagId> {
        self.tag_id
    }

    /// The span header, if the payload is long enough to carry one.
    pub fn span(&self) -> Option<u64> {
        span_of(&self.data)
    }

    /// The payload after the span header.
    pub fn payload(&self) -> Bytes {
        if self.data.len() < SPAN_SIZE {
            return Bytes::new();
        }
        self.data.slice(SPAN_SIZE..)
    }
}

/// Reads the little endian span header from the front of `data`.
pub fn span_of(data: &[u8]) -> Option<u64> {
    let span: [u8; SPAN_SIZE] = data.get(..SPAN_SIZE)?.try_into().ok()?;
    Some(u64::from_le_bytes(span))
}
