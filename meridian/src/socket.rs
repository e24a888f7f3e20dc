//! # Summary
//!
//! This module abstracts over external connections to clients and peer
//! machines.
//!
//! Wraps `tokio_util`'s length-delimited codec around a TCP stream and runs
//! bincode over the frames. This allows us to serialize and deserialize Rust
//! structs through a TCP connection with minimal boilerplate on the sending
//! and receiving ends.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// External receiving channel. Expects length-delimited, bincode-encoded
/// Rust data of type `R` sent via TCP.
pub struct Rx<R> {
    inner: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    _marker: PhantomData<R>,
}

/// External transmission channel. Sends length-delimited, bincode-encoded
/// Rust data of type `T` over TCP.
pub struct Tx<T> {
    inner: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    _marker: PhantomData<T>,
}

/// Split a `TcpStream` into a pair of receiving and transmitting channels
/// capable of reading and writing bincode-encoded data.
pub fn split<R, T>(stream: TcpStream) -> (Rx<R>, Tx<T>)
where R: serde::de::DeserializeOwned,
      T: serde::Serialize,
{
    let (read, write) = stream.into_split();
    let rx = Rx {
        inner: FramedRead::new(read, LengthDelimitedCodec::new()),
        _marker: PhantomData,
    };
    let tx = Tx {
        inner: FramedWrite::new(write, LengthDelimitedCodec::new()),
        _marker: PhantomData,
    };
    (rx, tx)
}

impl<R: serde::de::DeserializeOwned> Rx<R> {
    /// Receive the next value, or None once the connection closed or
    /// produced an undecodable frame.
    pub async fn recv(&mut self) -> Option<R> {
        loop {
            match self.inner.next().await? {
            | Ok(frame) => match bincode::deserialize(&frame) {
                | Ok(value) => return Some(value),
                | Err(error) => {
                    warn!("dropping undecodable frame: {}", error);
                    return None;
                }
            },
            | Err(error) => {
                warn!("socket read failed: {}", error);
                return None;
            }
            }
        }
    }
}

impl<R: serde::de::DeserializeOwned + Unpin> Stream for Rx<R> {
    type Item = R;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
        | Poll::Ready(Some(Ok(frame))) => match bincode::deserialize(&frame) {
            | Ok(value) => Poll::Ready(Some(value)),
            | Err(_) => Poll::Ready(None),
        },
        | Poll::Ready(_) => Poll::Ready(None),
        | Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: serde::Serialize> Tx<T> {
    /// Serialize and send one value. Errors are connection-fatal.
    pub async fn send(&mut self, value: &T) -> Result<(), std::io::Error> {
        let bytes = bincode::serialize(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.inner.send(Bytes::from(bytes)).await
    }
}
