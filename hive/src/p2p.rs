//! Streams between peers and the protocols running over them.
//!
//! A [`Streamer`] opens bidirectional [`Stream`]s to peers identified by
//! their overlay [`Address`], tagged with a protocol name. Messages are
//! postcard encoded and framed with a big endian `u32` length prefix.
//! Incoming streams are dispatched to [`ProtocolHandler`]s by a [`Router`].

use std::{fmt::Debug, io};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use hive_base::Address;
use nested_enum_utils::common_fields;
use serde::{Serialize, de::DeserializeOwned};
use snafu::{Backtrace, Snafu, ensure};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod protocol;

pub use self::protocol::{AcceptError, BlocklistLimit, ProtocolHandler, Router, RouterBuilder};

/// Maximum size of a single framed message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors on a [`Stream`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum StreamError {
    #[snafu(display("message of {size} bytes exceeds the maximum of {MAX_MESSAGE_SIZE}"))]
    TooLarge { size: usize },
    #[snafu(display("stream closed by peer"))]
    Closed {},
    #[snafu(display("peer {peer} is not reachable"))]
    Unreachable { peer: Address },
    #[snafu(display("peer {peer} does not support {protocol}"))]
    Unsupported { peer: Address, protocol: String },
    #[snafu(transparent)]
    Io { source: io::Error },
    #[snafu(transparent)]
    Encoding { source: postcard::Error },
}

/// A bidirectional stream to a peer.
#[derive(derive_more::Debug)]
pub struct Stream {
    peer: Address,
    #[debug(skip)]
    reader: Box<dyn AsyncRead + Send + Unpin>,
    #[debug(skip)]
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    #[debug(skip)]
    buffer: BytesMut,
}

impl Stream {
    /// Wraps the two halves of a transport stream to `peer`.
    pub fn new(
        peer: Address,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            peer,
            reader: Box::new(reader),
            writer: Box::new(writer),
            buffer: BytesMut::new(),
        }
    }

    /// The remote peer.
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// Writes a length prefixed, postcard encoded message.
    pub async fn write<T: Serialize>(&mut self, message: &T) -> Result<(), StreamError> {
        write_message(&mut self.writer, &mut self.buffer, message).await
    }

    /// Reads the next message, failing with [`StreamError::Closed`] at the
    /// end of the stream.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<T, StreamError> {
        match read_message(&mut self.reader, &mut self.buffer).await? {
            Some(message) => Ok(message),
            None => ClosedSnafu.fail(),
        }
    }

    /// Shuts down the sending half.
    pub async fn finish(&mut self) -> Result<(), StreamError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Opens streams to peers.
pub trait Streamer: Send + Sync + Debug + 'static {
    /// Opens a stream to `peer` for `protocol`.
    fn new_stream<'a>(
        &'a self,
        peer: Address,
        protocol: &'a str,
    ) -> BoxFuture<'a, Result<Stream, StreamError>>;
}

impl<T: Streamer + ?Sized> Streamer for std::sync::Arc<T> {
    fn new_stream<'a>(
        &'a self,
        peer: Address,
        protocol: &'a str,
    ) -> BoxFuture<'a, Result<Stream, StreamError>> {
        self.as_ref().new_stream(peer, protocol)
    }
}

/// A stream opened by a remote peer.
#[derive(Debug)]
pub struct Incoming {
    /// The protocol the peer asked for.
    pub protocol: String,
    /// The stream.
    pub stream: Stream,
}

/// Writes `message` as a length prefixed, postcard encoded frame.
pub async fn write_message<W, T>(
    writer: &mut W,
    buffer: &mut BytesMut,
    message: &T,
) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let size = postcard::experimental::serialized_size(message)?;
    ensure!(size <= MAX_MESSAGE_SIZE, TooLargeSnafu { size });
    buffer.clear();
    buffer.resize(size, 0u8);
    let slice = postcard::to_slice(message, buffer)?;
    writer.write_u32(size as u32).await?;
    writer.write_all(slice).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a frame and decodes it. `None` at a clean end of the stream.
pub async fn read_message<R, T>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<T>, StreamError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    match read_lp(reader, buffer).await? {
        None => Ok(None),
        Some(data) => Ok(Some(postcard::from_bytes(&data)?)),
    }
}

/// Reads a length prefixed frame.
///
/// Returns `None` if the stream ends before a new frame starts.
pub async fn read_lp<R>(reader: &mut R, buffer: &mut BytesMut) -> Result<Option<Bytes>, StreamError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    ensure!(size <= MAX_MESSAGE_SIZE, TooLargeSnafu { size });
    buffer.clear();
    buffer.resize(size, 0u8);
    reader.read_exact(&mut buffer[..]).await?;
    Ok(Some(buffer.split_to(size).freeze()))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
        payload: Vec<u8>,
    }

    #[tokio::test]
    async fn framing() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut a = Stream::new(Address::new([1; 32]), ar, aw);
        let mut b = Stream::new(Address::new([2; 32]), br, bw);

        let ping = Ping {
            n: 7,
            payload: vec![1; 3000],
        };
        let write = async {
            a.write(&ping).await.unwrap();
            a.finish().await.unwrap();
        };
        let read = async {
            let got: Ping = b.read().await.unwrap();
            assert_eq!(got, ping);
            let err = b.read::<Ping>().await.unwrap_err();
            assert!(matches!(err, StreamError::Closed { .. }));
        };
        tokio::join!(write, read);
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let err = write_message(&mut out, &mut buf, &big).await.unwrap_err();
        assert!(matches!(err, StreamError::TooLarge { .. }));

        let mut frame = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&[0; 16]);
        let err = read_lp(&mut &frame[..], &mut buf).await.unwrap_err();
        assert!(matches!(err, StreamError::TooLarge { .. }));
    }
}
