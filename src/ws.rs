//! Byte-stream façade over message-oriented WebSockets.
//!
//! The stream multiplexer and the TCP splice helpers both want a plain
//! `AsyncRead + AsyncWrite` pipe, while a WebSocket hands out discrete
//! frames. [`WsByteStream`] bridges the two: reads drain the current frame
//! and fetch the next one when exhausted, writes emit one binary frame per
//! call, and peer-initiated closes (normal close, going-away, abnormal
//! closure) are folded into a clean end-of-stream because the multiplexer
//! treats EOF as normal session termination.
//!
//! The adaptor is generic over the frame type so the same code serves the
//! gateway's `axum` sockets and the joining side's `tokio-tungstenite` ones.

use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What one WebSocket frame contributes to the byte stream.
pub enum FrameData {
    /// Payload bytes from a text or binary frame.
    Data(Bytes),
    /// Control frame with no payload semantics (ping/pong).
    Skip,
    /// The peer is closing the connection.
    Close,
}

/// Frame type of a particular WebSocket implementation.
pub trait WsFrame: Sized {
    type Error: std::error::Error + Send + Sync + 'static;

    fn into_frame_data(self) -> FrameData;
    fn binary(data: Bytes) -> Self;

    /// Whether a transport error means the peer went away and should read as
    /// end-of-stream rather than a hard failure.
    fn error_is_eof(err: &Self::Error) -> bool;
}

impl WsFrame for axum::extract::ws::Message {
    type Error = axum::Error;

    fn into_frame_data(self) -> FrameData {
        use axum::extract::ws::Message;
        match self {
            Message::Text(text) => FrameData::Data(Bytes::copy_from_slice(text.as_bytes())),
            Message::Binary(data) => FrameData::Data(data),
            Message::Ping(_) | Message::Pong(_) => FrameData::Skip,
            Message::Close(_) => FrameData::Close,
        }
    }

    fn binary(data: Bytes) -> Self {
        axum::extract::ws::Message::Binary(data)
    }

    fn error_is_eof(_err: &Self::Error) -> bool {
        // axum wraps the underlying error; by the time the server side sees
        // one the client is gone either way.
        true
    }
}

impl WsFrame for tokio_tungstenite::tungstenite::Message {
    type Error = tokio_tungstenite::tungstenite::Error;

    fn into_frame_data(self) -> FrameData {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Text(text) => FrameData::Data(Bytes::copy_from_slice(text.as_bytes())),
            Message::Binary(data) => FrameData::Data(data),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => FrameData::Skip,
            Message::Close(_) => FrameData::Close,
        }
    }

    fn binary(data: Bytes) -> Self {
        tokio_tungstenite::tungstenite::Message::Binary(data)
    }

    fn error_is_eof(err: &Self::Error) -> bool {
        use tokio_tungstenite::tungstenite::error::{Error, ProtocolError};
        matches!(
            err,
            Error::ConnectionClosed
                | Error::AlreadyClosed
                | Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
        )
    }
}

/// `AsyncRead`/`AsyncWrite` over a WebSocket.
///
/// Reads remember the unread remainder of the current frame. Writes emit one
/// binary frame per call; serialization of concurrent writers is inherited
/// from whoever owns the stream (the multiplexer keeps a single writer).
pub struct WsByteStream<S, M> {
    socket: S,
    read_buf: Bytes,
    _frame: PhantomData<fn() -> M>,
}

impl<S, M> WsByteStream<S, M>
where
    S: Stream<Item = Result<M, M::Error>> + Sink<M, Error = M::Error> + Unpin,
    M: WsFrame,
{
    pub fn new(socket: S) -> Self {
        WsByteStream {
            socket,
            read_buf: Bytes::new(),
            _frame: PhantomData,
        }
    }
}

impl<S, M> AsyncRead for WsByteStream<S, M>
where
    S: Stream<Item = Result<M, M::Error>> + Sink<M, Error = M::Error> + Unpin,
    M: WsFrame,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = buf.remaining().min(this.read_buf.len());
                let chunk = this.read_buf.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut this.socket).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(err))) => {
                    return if M::error_is_eof(&err) {
                        Poll::Ready(Ok(()))
                    } else {
                        Poll::Ready(Err(io::Error::other(err)))
                    };
                }
                Poll::Ready(Some(Ok(frame))) => match frame.into_frame_data() {
                    FrameData::Data(data) => this.read_buf = data,
                    FrameData::Skip => {}
                    FrameData::Close => return Poll::Ready(Ok(())),
                },
            }
        }
    }
}

impl<S, M> AsyncWrite for WsByteStream<S, M>
where
    S: Stream<Item = Result<M, M::Error>> + Sink<M, Error = M::Error> + Unpin,
    M: WsFrame,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.socket).poll_ready(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => Poll::Ready(Err(io::Error::other(err))),
            Poll::Ready(Ok(())) => {
                let msg = M::binary(Bytes::copy_from_slice(data));
                match Pin::new(&mut this.socket).start_send(msg) {
                    Ok(()) => Poll::Ready(Ok(data.len())),
                    Err(err) => Poll::Ready(Err(io::Error::other(err))),
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.socket)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.socket)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory WebSocket stand-in shared by the adaptor and session tests.

    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FakeMsg {
        Data(Bytes),
        Ping,
        Close,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("fake socket error")]
    pub struct FakeError;

    /// Scripted inbound frames, recorded outbound frames.
    pub struct FakeSocket {
        pub incoming: VecDeque<Result<FakeMsg, FakeError>>,
        pub sent: Vec<FakeMsg>,
    }

    impl FakeSocket {
        pub fn new(incoming: Vec<Result<FakeMsg, FakeError>>) -> Self {
            FakeSocket {
                incoming: incoming.into(),
                sent: Vec::new(),
            }
        }
    }

    impl WsFrame for FakeMsg {
        type Error = FakeError;

        fn into_frame_data(self) -> FrameData {
            match self {
                FakeMsg::Data(data) => FrameData::Data(data),
                FakeMsg::Ping => FrameData::Skip,
                FakeMsg::Close => FrameData::Close,
            }
        }

        fn binary(data: Bytes) -> Self {
            FakeMsg::Data(data)
        }

        fn error_is_eof(_err: &Self::Error) -> bool {
            false
        }
    }

    impl Stream for FakeSocket {
        type Item = Result<FakeMsg, FakeError>;

        fn poll_next(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Self::Item>> {
            Poll::Ready(self.incoming.pop_front())
        }
    }

    impl Sink<FakeMsg> for FakeSocket {
        type Error = FakeError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), FakeError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: FakeMsg) -> Result<(), FakeError> {
            self.sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), FakeError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), FakeError>> {
            Poll::Ready(Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeMsg, FakeSocket};
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn read_stitches_frames_and_skips_control() {
        let socket = FakeSocket::new(vec![
            Ok(FakeMsg::Data(Bytes::from_static(b"hello "))),
            Ok(FakeMsg::Ping),
            Ok(FakeMsg::Data(Bytes::from_static(b"world"))),
        ]);
        let mut stream = WsByteStream::new(socket);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn partial_reads_keep_frame_remainder() {
        let socket = FakeSocket::new(vec![Ok(FakeMsg::Data(Bytes::from_static(b"abcdef")))]);
        let mut stream = WsByteStream::new(socket);

        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn close_frame_is_eof() {
        let socket = FakeSocket::new(vec![
            Ok(FakeMsg::Data(Bytes::from_static(b"tail"))),
            Ok(FakeMsg::Close),
            Ok(FakeMsg::Data(Bytes::from_static(b"never seen"))),
        ]);
        let mut stream = WsByteStream::new(socket);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"tail");
    }

    #[tokio::test]
    async fn writes_become_binary_frames() {
        let socket = FakeSocket::new(vec![]);
        let mut stream = WsByteStream::new(socket);

        stream.write_all(b"mux bytes").await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(
            stream.socket.sent,
            vec![FakeMsg::Data(Bytes::from_static(b"mux bytes"))]
        );
    }
}
