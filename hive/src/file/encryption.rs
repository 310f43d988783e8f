//! Chunk encryption.
//!
//! A counter mode stream cipher over keccak-256: segment `i` of the input
//! is xored with `keccak256(keccak256(key || le32(init_ctr + i)))`. Chunk
//! data is padded with random bytes to [`CHUNK_SIZE`] before encryption so
//! that encrypted chunks do not reveal the content length; the span is
//! encrypted separately with the counter starting past the data segments.

use bytes::{BufMut, Bytes, BytesMut};
use hive_base::{
    chunk::{CHUNK_SIZE, ENCRYPTED_REFERENCE_SIZE, HASH_SIZE, KEY_LENGTH, SPAN_SIZE},
    hash::keccak256,
};
use nested_enum_utils::common_fields;
use rand::RngCore;
use snafu::{Backtrace, Snafu, ensure};

/// A per chunk encryption key.
pub type Key = [u8; KEY_LENGTH];

/// Counter offset of the span, past all data segments.
const SPAN_INIT_CTR: u32 = (CHUNK_SIZE / HASH_SIZE) as u32;

/// Errors from encrypting or decrypting.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EncryptionError {
    #[snafu(display("data of {len} bytes exceeds padding of {padding}"))]
    DataTooLong { len: usize, padding: usize },
    #[snafu(display("encrypted chunk too short: {len} bytes"))]
    TooShort { len: usize },
}

/// Generates a random key.
pub fn new_key() -> Key {
    let mut key = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// The counter mode cipher for one key.
#[derive(derive_more::Debug)]
pub struct Encryption {
    #[debug(skip)]
    key: Key,
    padding: usize,
    init_ctr: u32,
}

impl Encryption {
    /// Creates a cipher. With a non zero `padding`, inputs are padded with
    /// random bytes to exactly that length.
    pub fn new(key: Key, padding: usize, init_ctr: u32) -> Self {
        Self {
            key,
            padding,
            init_ctr,
        }
    }

    /// Pads and encrypts `data`.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let len = if self.padding > 0 {
            ensure!(
                data.len() <= self.padding,
                DataTooLongSnafu {
                    len: data.len(),
                    padding: self.padding
                }
            );
            self.padding
        } else {
            data.len()
        };
        let mut out = vec![0u8; len];
        out[..data.len()].copy_from_slice(data);
        rand::thread_rng().fill_bytes(&mut out[data.len()..]);
        self.transform(&mut out);
        Ok(out)
    }

    /// Decrypts `data`. Padding is left for the caller to strip.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        ensure!(
            self.padding == 0 || data.len() == self.padding,
            DataTooLongSnafu {
                len: data.len(),
                padding: self.padding
            }
        );
        let mut out = data.to_vec();
        self.transform(&mut out);
        Ok(out)
    }

    fn transform(&self, buf: &mut [u8]) {
        for (i, segment) in buf.chunks_mut(HASH_SIZE).enumerate() {
            let ctr = self.init_ctr.wrapping_add(i as u32);
            let ctr_hash = keccak256([&self.key[..], &ctr.to_le_bytes()[..]]);
            let segment_key = keccak256([ctr_hash]);
            for (b, k) in segment.iter_mut().zip(segment_key) {
                *b ^= k;
            }
        }
    }
}

/// Encrypts a `span || data` payload under a fresh key.
///
/// Returns the key and `encrypted span || encrypted padded data`.
pub fn encrypt_chunk(payload: &[u8]) -> Result<(Key, Bytes), EncryptionError> {
    ensure!(
        payload.len() >= SPAN_SIZE,
        TooShortSnafu { len: payload.len() }
    );
    let key = new_key();
    let span = Encryption::new(key, 0, SPAN_INIT_CTR).encrypt(&payload[..SPAN_SIZE])?;
    let data = Encryption::new(key, CHUNK_SIZE, 0).encrypt(&payload[SPAN_SIZE..])?;
    let mut out = BytesMut::with_capacity(SPAN_SIZE + CHUNK_SIZE);
    out.put_slice(&span);
    out.put_slice(&data);
    Ok((key, out.freeze()))
}

/// Decrypts a payload produced by [`encrypt_chunk`], returning `span ||
/// data` with the padding removed.
pub fn decrypt_chunk(key: &Key, payload: &[u8]) -> Result<Bytes, EncryptionError> {
    ensure!(
        payload.len() == SPAN_SIZE + CHUNK_SIZE,
        TooShortSnafu { len: payload.len() }
    );
    let span = Encryption::new(*key, 0, SPAN_INIT_CTR).decrypt(&payload[..SPAN_SIZE])?;
    let data = Encryption::new(*key, CHUNK_SIZE, 0).decrypt(&payload[SPAN_SIZE..])?;
    let mut span_bytes = [0u8; SPAN_SIZE];
    span_bytes.copy_from_slice(&span);
    let len = data_length(u64::from_le_bytes(span_bytes));
    let mut out = BytesMut::with_capacity(SPAN_SIZE + len);
    out.put_slice(&span);
    out.put_slice(&data[..len]);
    Ok(out.freeze())
}

/// Length of the data of an encrypted chunk with the given span: the span
/// itself for leaves, the size of the child references otherwise.
fn data_length(span: u64) -> usize {
    let chunk_size = CHUNK_SIZE as u64;
    let mut len = span;
    while len > chunk_size {
        len = len.div_ceil(chunk_size) * ENCRYPTED_REFERENCE_SIZE as u64;
    }
    len as usize
}
