//! Binary Merkle tree hashing of chunk data.
//!
//! The data of a chunk is zero padded to [`CHUNK_SIZE`] bytes and split into
//! [`BRANCHES`] segments of [`SEGMENT_SIZE`] bytes. Pairs of neighbouring
//! segments are hashed with keccak-256 level by level until a single root
//! remains, which is then hashed once more together with the span header.
//!
//! Allocating a [`Hasher`] is comparatively expensive, so hashers are handed
//! out by a bounded [`Pool`].

use std::sync::{LazyLock, Mutex};

use nested_enum_utils::common_fields;
use sha3::Digest;
use snafu::{Backtrace, Snafu, ensure};

use crate::{
    chunk::{BRANCHES, CHUNK_SIZE, HASH_SIZE, SPAN_SIZE},
    hash::new_hasher,
};

/// Size of a tree segment.
pub const SEGMENT_SIZE: usize = HASH_SIZE;

/// Default number of hashers kept by a [`Pool`].
pub const DEFAULT_POOL_CAPACITY: usize = 32;

static POOL: LazyLock<Pool> = LazyLock::new(|| Pool::new(DEFAULT_POOL_CAPACITY));

/// Errors from writing into a [`Hasher`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum BmtError {
    #[snafu(display("write of {len} bytes exceeds chunk size, {written} already written"))]
    Overflow { len: usize, written: usize },
}

/// A BMT hasher for a single chunk.
#[derive(derive_more::Debug)]
pub struct Hasher {
    span: [u8; SPAN_SIZE],
    #[debug(skip)]
    buffer: Box<[u8; CHUNK_SIZE]>,
    len: usize,
    #[debug(skip)]
    level: Vec<[u8; HASH_SIZE]>,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self {
            span: [0u8; SPAN_SIZE],
            buffer: Box::new([0u8; CHUNK_SIZE]),
            len: 0,
            level: Vec::with_capacity(BRANCHES / 2),
        }
    }

    /// Sets the span header that is hashed together with the tree root.
    pub fn set_header(&mut self, span: [u8; SPAN_SIZE]) {
        self.span = span;
    }

    /// Sets the span header from a length.
    pub fn set_header_u64(&mut self, span: u64) {
        self.span = span.to_le_bytes();
    }

    /// Appends data. The total written may not exceed [`CHUNK_SIZE`].
    pub fn write(&mut self, data: &[u8]) -> Result<usize, BmtError> {
        ensure!(
            self.len + data.len() <= CHUNK_SIZE,
            OverflowSnafu {
                len: data.len(),
                written: self.len
            }
        );
        self.buffer[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(data.len())
    }

    /// Number of data bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written since the last reset.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Computes `keccak(span || root)` over the zero padded data.
    pub fn hash(&mut self) -> [u8; HASH_SIZE] {
        self.buffer[self.len..].fill(0);
        let root = self.root();
        let mut h = new_hasher();
        h.update(self.span);
        h.update(root);
        h.finalize().into()
    }

    /// Restores the empty state.
    pub fn reset(&mut self) {
        self.span = [0u8; SPAN_SIZE];
        self.len = 0;
        self.level.clear();
    }

    fn root(&mut self) -> [u8; HASH_SIZE] {
        self.level.clear();
        for pair in self.buffer.chunks_exact(2 * SEGMENT_SIZE) {
            self.level.push(new_hasher().chain_update(pair).finalize().into());
        }
        while self.level.len() > 1 {
            let half = self.level.len() / 2;
            for i in 0..half {
                let mut h = new_hasher();
                h.update(self.level[2 * i]);
                h.update(self.level[2 * i + 1]);
                self.level[i] = h.finalize().into();
            }
            self.level.truncate(half);
        }
        self.level[0]
    }
}

/// A bounded pool of [`Hasher`]s.
#[derive(Debug)]
pub struct Pool {
    capacity: usize,
    hashers: Mutex<Vec<Hasher>>,
}

impl Pool {
    /// Creates a pool retaining up to `capacity` idle hashers.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            hashers: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Takes a reset hasher out of the pool, allocating one if it is empty.
    ///
    /// The hasher returns to the pool when the guard is dropped.
    pub fn get(&self) -> PooledHasher<'_> {
        let hasher = self.hashers.lock().expect("poisoned").pop();
        PooledHasher {
            pool: self,
            hasher: Some(hasher.unwrap_or_default()),
        }
    }

    /// Number of idle hashers.
    pub fn idle(&self) -> usize {
        self.hashers.lock().expect("poisoned").len()
    }

    fn put(&self, mut hasher: Hasher) {
        hasher.reset();
        let mut hashers = self.hashers.lock().expect("poisoned");
        if hashers.len() < self.capacity {
            hashers.push(hasher);
        }
    }
}

/// A [`Hasher`] borrowed from a [`Pool`].
#[derive(Debug)]
pub struct PooledHasher<'a> {
    pool: &'a Pool,
    hasher: Option<Hasher>,
}

impl std::ops::Deref for PooledHasher<'_> {
    type Target = Hasher;

    fn deref(&self) -> &Self::Target {
        self.hasher.as_ref().expect("present until drop")
    }
}

impl std::ops::DerefMut for PooledHasher<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.hasher.as_mut().expect("present until drop")
    }
}

impl Drop for PooledHasher<'_> {
    fn drop(&mut self) {
        if let Some(hasher) = self.hasher.take() {
            self.pool.put(hasher);
        }
    }
}

/// Borrows a hasher from the process wide pool.
pub fn pooled() -> PooledHasher<'static> {
    POOL.get()
}

/// Computes the BMT hash of `data` under `span`.
///
/// Fails if `data` is longer than [`CHUNK_SIZE`].
pub fn hash(span: [u8; SPAN_SIZE], data: &[u8]) -> Result<[u8; HASH_SIZE], BmtError> {
    let mut hasher = pooled();
    hasher.set_header(span);
    hasher.write(data)?;
    Ok(hasher.hash())
}
