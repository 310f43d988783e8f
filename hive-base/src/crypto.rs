//! secp256k1 keys, ethereum style addresses and recoverable signatures.
//!
//! Signatures are made over the ethereum personal message digest
//! `keccak256("\x19Ethereum Signed Message:\n" || len(data) || data)` and
//! serialized as `r || s || v` with `v = 27 + recovery id`.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use k256::{
    PublicKey,
    ecdsa::{RecoveryId, SigningKey, VerifyingKey},
    elliptic_curve::{rand_core::CryptoRngCore, sec1::ToEncodedPoint},
};
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, Snafu, ensure};

use crate::{address::Address, chunk::SOC_SIGNATURE_SIZE, hash::keccak256};

/// Length of an [`EthAddress`].
pub const ETH_ADDRESS_LENGTH: usize = 20;

/// Errors from key handling, signing and recovery.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CryptoError {
    #[snafu(display("invalid length {len}"))]
    InvalidLength { len: usize },
    #[snafu(display("invalid recovery byte {v}"))]
    InvalidRecoveryId { v: u8 },
    #[snafu(transparent)]
    Ecdsa { source: k256::ecdsa::Error },
    #[snafu(transparent)]
    Key { source: k256::elliptic_curve::Error },
    #[snafu(transparent)]
    Decode { source: data_encoding::DecodeError },
}

/// The 20 byte ethereum address of a secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EthAddress([u8; ETH_ADDRESS_LENGTH]);

impl EthAddress {
    /// Creates an address from raw bytes.
    pub const fn new(bytes: [u8; ETH_ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates an address from a 20 byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; ETH_ADDRESS_LENGTH] = bytes.try_into().ok().context(InvalidLengthSnafu {
            len: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Derives the address of a public key: the last 20 bytes of the keccak
    /// hash of the uncompressed point without its tag byte.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let point = key.as_affine().to_encoded_point(false);
        let hash = keccak256([&point.as_bytes()[1..]]);
        let mut out = [0u8; ETH_ADDRESS_LENGTH];
        out.copy_from_slice(&hash[12..]);
        Self(out)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; ETH_ADDRESS_LENGTH] {
        &self.0
    }
}

impl AsRef<[u8]> for EthAddress {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.0, f)
    }
}

impl Debug for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EthAddress({self})")
    }
}

impl FromStr for EthAddress {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes())?;
        Self::from_slice(&bytes)
    }
}

/// A recoverable signature, `r || s || v`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SOC_SIGNATURE_SIZE]);

impl Signature {
    /// Creates a signature from a 65 byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SOC_SIGNATURE_SIZE] =
            bytes.try_into().ok().context(InvalidLengthSnafu {
                len: bytes.len(),
            })?;
        Ok(Self(bytes))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; SOC_SIGNATURE_SIZE] {
        &self.0
    }

    fn split(&self) -> Result<(k256::ecdsa::Signature, RecoveryId), CryptoError> {
        let v = self.0[64];
        let recid = v
            .checked_sub(27)
            .and_then(RecoveryId::from_byte)
            .context(InvalidRecoveryIdSnafu { v })?;
        let sig = k256::ecdsa::Signature::from_slice(&self.0[..64])?;
        Ok((sig, recid))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", data_encoding::HEXLOWER.encode(&self.0))
    }
}

/// Hashes `data` with the ethereum personal message prefix.
pub fn eth_message_digest(data: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", data.len());
    keccak256([prefix.as_bytes(), data])
}

/// Recovers the public key that produced `signature` over `data`.
pub fn recover(signature: &Signature, data: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let (sig, recid) = signature.split()?;
    let digest = eth_message_digest(data);
    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recid)?;
    Ok(key)
}

/// Recovers the [`EthAddress`] that produced `signature` over `data`.
pub fn recover_address(signature: &Signature, data: &[u8]) -> Result<EthAddress, CryptoError> {
    recover(signature, data).map(|key| EthAddress::from_public_key(&key))
}

/// Derives the overlay address of a node from its ethereum address.
pub fn overlay_address(owner: &EthAddress, network_id: u64, nonce: &[u8; 32]) -> Address {
    Address::new(keccak256([
        owner.as_bytes().as_slice(),
        network_id.to_le_bytes().as_slice(),
        nonce.as_slice(),
    ]))
}

/// A secp256k1 signing key.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
}

impl Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signer({})", self.eth_address())
    }
}

impl Signer {
    /// Creates a signer from the 32 byte secret scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        ensure!(bytes.len() == 32, InvalidLengthSnafu { len: bytes.len() });
        let key = SigningKey::from_slice(bytes)?;
        Ok(Self { key })
    }

    /// Generates a new random key.
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            key: SigningKey::random(rng),
        }
    }

    /// The secret scalar.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes().into()
    }

    /// The public key.
    pub fn public_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }

    /// The ethereum address of the public key.
    pub fn eth_address(&self) -> EthAddress {
        EthAddress::from_public_key(self.key.verifying_key())
    }

    /// Signs `data` with the ethereum message prefix.
    pub fn sign(&self, data: &[u8]) -> Result<Signature, CryptoError> {
        let digest = eth_message_digest(data);
        let (sig, recid) = self.key.sign_prehash_recoverable(&digest)?;
        let mut out = [0u8; SOC_SIGNATURE_SIZE];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = 27 + recid.to_byte();
        Ok(Signature(out))
    }

    /// Computes the ECDH shared secret with `public`.
    pub fn shared_secret(&self, public: &PublicKey) -> [u8; 32] {
        let shared = k256::ecdh::diffie_hellman(self.key.as_nonzero_scalar(), public.as_affine());
        (*shared.raw_secret_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    const KEY: &str = "634fb5a872396d9693e5c9f9d7233cfa93f395c093371017ff44aa9ae6564cdd";

    fn signer() -> Signer {
        let bytes = data_encoding::HEXLOWER.decode(KEY.as_bytes()).unwrap();
        Signer::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn eth_address_of_known_key() {
        let signer = signer();
        assert_eq!(
            signer.eth_address().to_string(),
            "8d3766440f0d7b949a5e32995d09619a7f86e632"
        );
        assert_eq!(
            EthAddress::from_str("0x8d3766440f0d7b949a5e32995d09619a7f86e632").unwrap(),
            signer.eth_address()
        );
    }

    #[test]
    fn sign_recover() {
        let signer = signer();
        let sig = signer.sign(b"hello world").unwrap();
        assert!(sig.as_bytes()[64] == 27 || sig.as_bytes()[64] == 28);
        let owner = recover_address(&sig, b"hello world").unwrap();
        assert_eq!(owner, signer.eth_address());
        let other = recover_address(&sig, b"hello worle").unwrap();
        assert_ne!(other, signer.eth_address());
    }

    #[test]
    fn bad_recovery_byte() {
        let signer = signer();
        let mut bytes = *signer.sign(b"x").unwrap().as_bytes();
        bytes[64] = 3;
        let sig = Signature::from_slice(&bytes).unwrap();
        assert!(matches!(
            recover(&sig, b"x"),
            Err(CryptoError::InvalidRecoveryId { .. })
        ));
        assert!(Signature::from_slice(&bytes[..64]).is_err());
    }

    #[test]
    fn ecdh_agrees() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        let a = Signer::generate(&mut rng);
        let b = Signer::generate(&mut rng);
        let ab = a.shared_secret(&PublicKey::from(b.public_key()));
        let ba = b.shared_secret(&PublicKey::from(a.public_key()));
        assert_eq!(ab, ba);
        let restored = Signer::from_bytes(&a.to_bytes()).unwrap();
        assert_eq!(restored.eth_address(), a.eth_address());
    }
}
