//! Content addressed chunks: the address is the BMT hash of the payload.

use bytes::{BufMut, Bytes, BytesMut};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu, ensure};

use crate::{
    address::Address,
    bmt,
    chunk::{CHUNK_SIZE, CHUNK_WITH_SPAN_SIZE, Chunk, SPAN_SIZE},
};

/// Errors building a content addressed chunk.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CacError {
    #[snafu(display("chunk data too short: {len} bytes"))]
    TooShort { len: usize },
    #[snafu(display("chunk data too large: {len} bytes"))]
    TooLarge { len: usize },
}

/// Creates a chunk from `data`, which must be between 1 and
/// [`CHUNK_SIZE`] bytes long. The span is the data length.
pub fn new(data: &[u8]) -> Result<Chunk, CacError> {
    ensure!(!data.is_empty(), TooShortSnafu { len: 0usize });
    ensure!(data.len() <= CHUNK_SIZE, TooLargeSnafu { len: data.len() });
    let span = (data.len() as u64).to_le_bytes();
    let mut payload = BytesMut::with_capacity(SPAN_SIZE + data.len());
    payload.put_slice(&span);
    payload.put_slice(data);
    Ok(build(span, payload.freeze()))
}

/// Creates a chunk from a payload already laid out as `span || data`.
///
/// The span is taken as is, which allows intermediate chunks whose span is
/// the length of the whole subtree.
pub fn new_with_span(payload: impl Into<Bytes>) -> Result<Chunk, CacError> {
    let payload: Bytes = payload.into();
    ensure!(
        payload.len() >= SPAN_SIZE,
        TooShortSnafu { len: payload.len() }
    );
    ensure!(
        payload.len() <= CHUNK_WITH_SPAN_SIZE,
        TooLargeSnafu { len: payload.len() }
    );
    let span = span_header(&payload);
    Ok(build(span, payload))
}

/// Computes the address of a `span || data` payload.
///
/// Returns `None` if the payload is not a valid size.
pub fn address_of(payload: &[u8]) -> Option<Address> {
    if payload.len() < SPAN_SIZE || payload.len() > CHUNK_WITH_SPAN_SIZE {
        return None;
    }
    let span = span_header(payload);
    let hash = bmt::hash(span, &payload[SPAN_SIZE..]).ok()?;
    Some(Address::new(hash))
}

/// Whether the chunk address is the BMT hash of its payload.
pub fn valid(chunk: &Chunk) -> bool {
    address_of(chunk.data()).is_some_and(|addr| &addr == chunk.address())
}

fn span_header(payload: &[u8]) -> [u8; SPAN_SIZE] {
    let mut span = [0u8; SPAN_SIZE];
    span.copy_from_slice(&payload[..SPAN_SIZE]);
    span
}

fn build(span: [u8; SPAN_SIZE], payload: Bytes) -> Chunk {
    let mut hasher = bmt::pooled();
    hasher.set_header(span);
    // payload length was checked by the callers
    let _ = hasher.write(&payload[SPAN_SIZE..]);
    Chunk::new(Address::new(hasher.hash()), payload)
}
