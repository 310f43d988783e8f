//! The keccak-256 hasher used for chunk addresses, signatures and stamps.

use sha3::{Digest, Keccak256};

/// Length of a keccak-256 digest.
pub const HASH_SIZE: usize = 32;

/// Creates a fresh keccak-256 hasher.
pub fn new_hasher() -> Keccak256 {
    Keccak256::new()
}

/// Hashes the concatenation of `parts`.
pub fn keccak256<I, T>(parts: I) -> [u8; HASH_SIZE]
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut hasher = new_hasher();
    for part in parts {
        hasher.update(part.as_ref());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        let h = keccak256::<_, &[u8]>([]);
        assert_eq!(
            data_encoding::HEXLOWER.encode(&h),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn concatenation() {
        assert_eq!(keccak256([b"ab".as_slice(), b"c".as_slice()]), keccak256([b"abc"]));
    }
}
