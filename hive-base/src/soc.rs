//! Single owner chunks.
//!
//! A single owner chunk wraps a content addressed chunk behind an id and a
//! signature of the owner over `keccak256(id || inner address)`. Its
//! address is `keccak256(id || owner)`, so the owner can publish different
//! content under the same address over time.

use bytes::{BufMut, BytesMut};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu, ensure};

use crate::{
    address::Address,
    cac,
    chunk::{Chunk, HASH_SIZE, SOC_MAX_CHUNK_SIZE, SOC_MIN_CHUNK_SIZE, SOC_SIGNATURE_SIZE},
    crypto::{self, CryptoError, EthAddress, Signature, Signer},
    hash::keccak256,
};

/// The 32 byte identifier chosen by the owner.
pub type Id = [u8; HASH_SIZE];

/// Errors building or parsing single owner chunks.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SocError {
    #[snafu(display("invalid soc payload size {len}"))]
    InvalidSize { len: usize },
    #[snafu(display("wrapped chunk is invalid"))]
    InvalidInner { source: cac::CacError },
    #[snafu(display("signature error"))]
    Signature { source: CryptoError },
    #[snafu(display("soc is not signed"))]
    Unsigned {},
    #[snafu(display("soc address mismatch"))]
    AddressMismatch {},
}

/// A single owner chunk.
#[derive(Debug, Clone)]
pub struct Soc {
    id: Id,
    owner: Option<EthAddress>,
    signature: Option<Signature>,
    chunk: Chunk,
}

impl Soc {
    /// Creates an unsigned single owner chunk wrapping `chunk`.
    pub fn new(id: Id, chunk: Chunk) -> Self {
        Self {
            id,
            owner: None,
            signature: None,
            chunk,
        }
    }

    /// Creates a single owner chunk from an existing owner and signature.
    pub fn new_signed(id: Id, chunk: Chunk, owner: EthAddress, signature: Signature) -> Self {
        Self {
            id,
            owner: Some(owner),
            signature: Some(signature),
            chunk,
        }
    }

    /// The id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The owner, once signed.
    pub fn owner(&self) -> Option<&EthAddress> {
        self.owner.as_ref()
    }

    /// The signature, once signed.
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// The wrapped content addressed chunk.
    pub fn wrapped_chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// The address, `keccak256(id || owner)`.
    pub fn address(&self) -> Result<Address, SocError> {
        let owner = self.owner.context(UnsignedSnafu)?;
        Ok(create_address(&self.id, &owner))
    }

    /// Signs with `signer` and returns the serialized chunk.
    pub fn sign(&mut self, signer: &Signer) -> Result<Chunk, SocError> {
        let digest = digest(&self.id, self.chunk.address());
        let signature = signer.sign(&digest).context(SignatureSnafu)?;
        self.signature = Some(signature);
        self.owner = Some(signer.eth_address());
        self.to_chunk()
    }

    /// Serializes into a chunk with payload `id || signature || inner payload`.
    pub fn to_chunk(&self) -> Result<Chunk, SocError> {
        let signature = self.signature.context(UnsignedSnafu)?;
        let address = self.address()?;
        let inner = self.chunk.data();
        let mut payload = BytesMut::with_capacity(HASH_SIZE + SOC_SIGNATURE_SIZE + inner.len());
        payload.put_slice(&self.id);
        payload.put_slice(signature.as_bytes());
        payload.put_slice(inner);
        Ok(Chunk::new(address, payload.freeze()))
    }

    /// Parses a single owner chunk, recovering the owner from the
    /// signature and checking the chunk address.
    pub fn from_chunk(chunk: &Chunk) -> Result<Self, SocError> {
        let data = chunk.data();
        ensure!(
            data.len() >= SOC_MIN_CHUNK_SIZE && data.len() <= SOC_MAX_CHUNK_SIZE,
            InvalidSizeSnafu { len: data.len() }
        );
        let mut id = [0u8; HASH_SIZE];
        id.copy_from_slice(&data[..HASH_SIZE]);
        let signature = Signature::from_slice(&data[HASH_SIZE..HASH_SIZE + SOC_SIGNATURE_SIZE])
            .context(SignatureSnafu)?;
        let inner = cac::new_with_span(data.slice(HASH_SIZE + SOC_SIGNATURE_SIZE..))
            .context(InvalidInnerSnafu)?;
        let owner = crypto::recover_address(&signature, &digest(&id, inner.address()))
            .context(SignatureSnafu)?;
        let soc = Self::new_signed(id, inner, owner, signature);
        ensure!(&soc.address()? == chunk.address(), AddressMismatchSnafu);
        Ok(soc)
    }
}

/// The address of a single owner chunk with `id` owned by `owner`.
pub fn create_address(id: &Id, owner: &EthAddress) -> Address {
    Address::new(keccak256([id.as_slice(), owner.as_bytes().as_slice()]))
}

/// The digest signed by the owner, `keccak256(id || inner address)`.
pub fn digest(id: &Id, inner: &Address) -> [u8; HASH_SIZE] {
    keccak256([id.as_slice(), inner.as_bytes().as_slice()])
}

/// Whether `chunk` is a well formed single owner chunk.
pub fn valid(chunk: &Chunk) -> bool {
    Soc::from_chunk(chunk).is_ok()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use data_encoding::HEXLOWER;

    use super::*;

    const KEY: &str = "634fb5a872396d9693e5c9f9d7233cfa93f395c093371017ff44aa9ae6564cdd";
    const OWNER: &str = "8d3766440f0d7b949a5e32995d09619a7f86e632";
    const SIG: &str = "5acd384febc133b7b245e5ddc62d82d2cded9182d2716126cd8844509af65a053deb418208027f548e3e88343af6f84a8772fb3cebc0a1833a0ea7ec0c1348311b";
    const ADDRESS: &str = "9d453ebb73b2fedaaf44ceddcf7a0aa37f3e3d6453fea5841c31f0ea6d61dc85";

    fn signer() -> Signer {
        Signer::from_bytes(&HEXLOWER.decode(KEY.as_bytes()).unwrap()).unwrap()
    }

    #[test]
    fn known_vector() {
        let id = [0u8; 32];
        let inner = cac::new(b"foo").unwrap();
        let owner = EthAddress::from_str(OWNER).unwrap();
        let sig = Signature::from_slice(&HEXLOWER.decode(SIG.as_bytes()).unwrap()).unwrap();
        let soc = Soc::new_signed(id, inner.clone(), owner, sig);
        let chunk = soc.to_chunk().unwrap();
        assert_eq!(chunk.address().to_string(), ADDRESS);
        assert!(valid(&chunk));

        let parsed = Soc::from_chunk(&chunk).unwrap();
        assert_eq!(parsed.owner(), Some(&owner));
        assert_eq!(parsed.wrapped_chunk().address(), inner.address());
        assert_eq!(parsed.id(), &id);
    }

    #[test]
    fn sign_roundtrip() {
        let signer = signer();
        let id = keccak256([b"topic"]);
        let inner = cac::new(b"foo").unwrap();
        let mut soc = Soc::new(id, inner);
        assert!(soc.to_chunk().is_err());
        let chunk = soc.sign(&signer).unwrap();
        assert!(valid(&chunk));
        let parsed = Soc::from_chunk(&chunk).unwrap();
        assert_eq!(parsed.owner().unwrap().to_string(), OWNER);
        assert_eq!(*chunk.address(), create_address(&id, &signer.eth_address()));
    }

    #[test]
    fn bit_flips_invalidate() {
        let signer = signer();
        let mut soc = Soc::new([7u8; 32], cac::new(b"some data").unwrap());
        let chunk = soc.sign(&signer).unwrap();
        let data = chunk.data().to_vec();
        // id, signature (r and s) and inner data
        for pos in [0, 31, 32, 60, 100, data.len() - 1] {
            let mut flipped = data.clone();
            flipped[pos] ^= 0x01;
            let tampered = Chunk::new(*chunk.address(), flipped);
            assert!(!valid(&tampered), "flip at {pos} still valid");
        }
    }

    #[test]
    fn too_short() {
        let chunk = Chunk::new(Address::ZERO, vec![0u8; SOC_MIN_CHUNK_SIZE - 1]);
        assert!(matches!(
            Soc::from_chunk(&chunk),
            Err(SocError::InvalidSize { .. })
        ));
    }
}
