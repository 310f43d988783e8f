//! Splitting byte streams into chunk tries and joining them back.
//!
//! Content is cut into [`CHUNK_SIZE`] leaves. The references of up to
//! [`BRANCHES`] siblings are concatenated into an intermediate chunk whose
//! span is the byte length of the whole subtree, level by level, until a
//! single root remains. Encrypted content carries the decryption key of
//! each chunk next to its address, halving the branching factor.
//!
//! [`CHUNK_SIZE`]: hive_base::chunk::CHUNK_SIZE
//! [`BRANCHES`]: hive_base::chunk::BRANCHES

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use hive_base::{
    Address,
    chunk::{ENCRYPTED_REFERENCE_SIZE, HASH_SIZE, KEY_LENGTH},
    storage::StorageError,
};
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

pub mod encryption;
mod joiner;
pub mod pipeline;

pub use self::{
    encryption::Key,
    joiner::Joiner,
    pipeline::{Pipeline, PipelineBuilder, feed_pipeline},
};

/// Errors from the splitter pipeline.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum PipelineError {
    #[snafu(display("short write: {written} of {expected} bytes"))]
    ShortWrite { written: usize, expected: usize },
    #[snafu(display("invalid reference length {len}"))]
    ReferenceLength { len: usize },
    #[snafu(display("hash trie ended with {refs} references on the top level"))]
    InconsistentRefs { refs: usize },
    #[snafu(display("pipeline has no terminal writer"))]
    Unterminated {},
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    Postage { source: hive_postage::PostageError },
    #[snafu(transparent)]
    Bmt { source: hive_base::bmt::BmtError },
    #[snafu(transparent)]
    Encryption { source: encryption::EncryptionError },
    #[snafu(transparent)]
    Io { source: std::io::Error },
}

/// Errors from reading content back.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum JoinError {
    #[snafu(display("chunk {address} is malformed"))]
    Malformed { address: Address },
    #[snafu(display("offset {offset} is past the end of {size} bytes"))]
    InvalidOffset { offset: u64, size: u64 },
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    Encryption { source: encryption::EncryptionError },
}

/// Identifies stored content: the root address, plus the key for
/// encrypted content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    address: Address,
    key: Option<Key>,
}

impl Reference {
    /// A plain reference.
    pub fn new(address: Address) -> Self {
        Self { address, key: None }
    }

    /// A reference to encrypted content.
    pub fn encrypted(address: Address, key: Key) -> Self {
        Self {
            address,
            key: Some(key),
        }
    }

    /// The address of the referenced chunk.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The decryption key, for encrypted content.
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Whether the referenced content is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Serialized length, [`HASH_SIZE`] or [`ENCRYPTED_REFERENCE_SIZE`].
    pub fn len(&self) -> usize {
        if self.is_encrypted() {
            ENCRYPTED_REFERENCE_SIZE
        } else {
            HASH_SIZE
        }
    }

    /// Serializes as `address || key`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(self.address.as_bytes());
        if let Some(key) = &self.key {
            out.extend_from_slice(key);
        }
        out
    }

    /// Parses a 32 or 64 byte reference.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PipelineError> {
        let mut address = [0u8; HASH_SIZE];
        match bytes.len() {
            HASH_SIZE => {
                address.copy_from_slice(bytes);
                Ok(Self::new(Address::new(address)))
            }
            ENCRYPTED_REFERENCE_SIZE => {
                let mut key = [0u8; KEY_LENGTH];
                address.copy_from_slice(&bytes[..HASH_SIZE]);
                key.copy_from_slice(&bytes[HASH_SIZE..]);
                Ok(Self::encrypted(Address::new(address), key))
            }
            len => ReferenceLengthSnafu { len }.fail(),
        }
    }
}

impl From<Address> for Reference {
    fn from(address: Address) -> Self {
        Self::new(address)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.to_bytes(), f)
    }
}

impl Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print keys
        write!(f, "Reference({}", self.address.fmt_short())?;
        if self.is_encrypted() {
            write!(f, ", encrypted")?;
        }
        write!(f, ")")
    }
}

impl FromStr for Reference {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|_| ReferenceLengthSnafu { len: s.len() / 2 }.build())?;
        Self::from_slice(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_parsing() {
        let plain = Reference::new(Address::new([1; 32]));
        assert_eq!(Reference::from_slice(&plain.to_bytes()).unwrap(), plain);
        assert_eq!(plain.to_string().parse::<Reference>().unwrap(), plain);

        let encrypted = Reference::encrypted(Address::new([1; 32]), [2; 32]);
        assert_eq!(encrypted.len(), 64);
        let parsed = Reference::from_slice(&encrypted.to_bytes()).unwrap();
        assert_eq!(parsed.key(), Some(&[2; 32]));

        assert!(matches!(
            Reference::from_slice(&[0; 33]),
            Err(PipelineError::ReferenceLength { len: 33, .. })
        ));
        assert!(!format!("{encrypted:?}").contains("0202"));
    }
}
