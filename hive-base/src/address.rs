//! Swarm addresses and the proximity metric over them.

use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display},
    str::FromStr,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu, ensure};

/// Length of an [`Address`] in bytes.
pub const ADDRESS_LENGTH: usize = 32;

/// The highest proximity order used to assign chunks and peers to bins.
pub const MAX_PO: u8 = 31;

/// A 32 byte address of a chunk or an overlay node.
///
/// Content addressed chunks are addressed by their BMT hash, single owner
/// chunks by the hash of their id and owner, nodes by their overlay address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Address([u8; ADDRESS_LENGTH]);

/// Errors when constructing or comparing [`Address`]es.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AddressError {
    #[snafu(display("invalid address length {len}"))]
    InvalidLength { len: usize },
    #[snafu(transparent)]
    Decode { source: data_encoding::DecodeError },
    /// Both candidates share the same proximity order with the pivot.
    #[snafu(display("addresses are incomparable"))]
    Incomparable {},
}

impl Address {
    /// The unset address.
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    /// Creates an address from raw bytes.
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates an address from a slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        ensure!(
            bytes.len() == ADDRESS_LENGTH,
            InvalidLengthSnafu { len: bytes.len() }
        );
        let mut out = [0u8; ADDRESS_LENGTH];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Returns the address bytes.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Whether this is the [`Address::ZERO`] sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LENGTH]
    }

    /// Number of leading bits `self` and `other` have in common.
    ///
    /// Equal addresses report `u8::MAX`.
    pub fn proximity(&self, other: &Address) -> u8 {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let x = a ^ b;
            if x != 0 {
                return (i * 8) as u8 + x.leading_zeros() as u8;
            }
        }
        u8::MAX
    }

    /// The proximity order of `other` relative to `self`, capped at [`MAX_PO`].
    pub fn bin(&self, other: &Address) -> u8 {
        self.proximity(other).min(MAX_PO)
    }

    /// Returns whether `x` has a strictly higher proximity order to `self`
    /// than `y`.
    ///
    /// Fails with [`AddressError::Incomparable`] when both share the same
    /// proximity order.
    pub fn closer(&self, x: &Address, y: &Address) -> Result<bool, AddressError> {
        let px = self.proximity(x);
        let py = self.proximity(y);
        ensure!(px != py, IncomparableSnafu);
        Ok(px > py)
    }

    /// Compares the XOR distance of `x` and `y` to `self`.
    ///
    /// [`Ordering::Less`] means `x` is closer.
    pub fn distance_cmp(&self, x: &Address, y: &Address) -> Ordering {
        for ((p, a), b) in self.0.iter().zip(x.0.iter()).zip(y.0.iter()) {
            match (p ^ a).cmp(&(p ^ b)) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Whether `x` is strictly closer to `self` than `y`.
    ///
    /// Equal proximity orders are resolved by comparing the distances
    /// byte by byte.
    pub fn is_closer(&self, x: &Address, y: &Address) -> bool {
        match self.closer(x, y) {
            Ok(closer) => closer,
            Err(_) => self.distance_cmp(x, y) == Ordering::Less,
        }
    }

    /// Shortened hex representation, for logging.
    pub fn fmt_short(&self) -> impl Display + 'static {
        AddressShort([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

struct AddressShort([u8; 4]);

impl Display for AddressShort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.0, f)
    }
}

impl From<[u8; ADDRESS_LENGTH]> for Address {
    fn from(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl From<Address> for [u8; ADDRESS_LENGTH] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.0, f)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes())?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let data: [u8; ADDRESS_LENGTH] = Deserialize::deserialize(deserializer)?;
            Ok(Self(data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(prefix: &[u8]) -> Address {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes[..prefix.len()].copy_from_slice(prefix);
        Address::new(bytes)
    }

    #[test]
    fn parse_roundtrip() {
        let s = "2387e8e7d8a48c2a9339c97c1dc3461a9a7aa07e994c5cb8b38fd7c1b3e6ea48";
        let a: Address = s.parse().unwrap();
        assert_eq!(a.to_string(), s);
        assert_eq!(Address::from_str(&s.to_uppercase()).unwrap(), a);
        assert!(Address::from_str("abcd").is_err());
        assert!(Address::from_str("zz").is_err());
    }

    #[test]
    fn zero() {
        assert!(Address::ZERO.is_zero());
        assert!(!addr(&[1]).is_zero());
        assert_eq!(Address::default(), Address::ZERO);
    }

    #[test]
    fn proximity_order() {
        let a = addr(&[0b1000_0000]);
        let b = addr(&[0b0000_0000]);
        assert_eq!(a.proximity(&b), 0);
        let c = addr(&[0b1100_0000]);
        assert_eq!(a.proximity(&c), 1);
        let d = addr(&[0xff, 0x00]);
        let e = addr(&[0xff, 0x01]);
        assert_eq!(d.proximity(&e), 15);
        assert_eq!(d.proximity(&d), u8::MAX);
        assert_eq!(d.bin(&e), 15);
        let f = addr(&[0xff, 0xff, 0xff, 0xff, 0x01]);
        let g = addr(&[0xff, 0xff, 0xff, 0xff, 0x00]);
        assert_eq!(f.proximity(&g), 39);
        assert_eq!(f.bin(&g), MAX_PO);
    }

    #[test]
    fn closer_by_proximity() {
        let pivot = addr(&[0b1111_0000]);
        let near = addr(&[0b1110_0000]);
        let far = addr(&[0b0000_0000]);
        assert!(pivot.closer(&near, &far).unwrap());
        assert!(!pivot.closer(&far, &near).unwrap());

        let near2 = addr(&[0b1110_1000]);
        assert!(matches!(
            pivot.closer(&near, &near2),
            Err(AddressError::Incomparable { .. })
        ));
        // ties resolve by distance
        assert!(pivot.is_closer(&near, &near2));
        assert!(!pivot.is_closer(&near2, &near));
        assert!(!pivot.is_closer(&near, &near));
    }

    #[test]
    fn serde_human_readable() {
        let a = addr(&[0xab, 0xcd]);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, format!("\"{a}\""));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);

        let bytes = postcard::to_stdvec(&a).unwrap();
        assert_eq!(bytes.len(), ADDRESS_LENGTH);
        let back: Address = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(a, back);
    }
}
