//! WebSocket as a byte stream
//!
//! Wraps a [`WebSocketStream`] so SSH clients and the bridge pumps can treat
//! it like a TCP socket: binary and text frames are read as raw bytes,
//! control frames are skipped, a close frame reads as EOF, and writes go
//! out as binary frames.

use bytes::{Buf, Bytes};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
    read_closed: bool,
    close_sent: bool,
}

impl<S> WsByteStream<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
            read_closed: false,
            close_sent: false,
        }
    }

    /// Send a text frame, used for human-readable diagnostics.
    pub async fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.inner
            .send(Message::Text(text.to_string()))
            .await
            .map_err(into_io)
    }

    /// Send a close frame carrying `code` and `reason`.
    pub async fn close_with(&mut self, code: CloseCode, reason: &str) -> io::Result<()> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        };
        match self.inner.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(into_io(e)),
        }
    }
}

fn into_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, err)
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
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
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf = Bytes::from(data),
                Some(Ok(Message::Text(text))) => this.read_buf = Bytes::from(text.into_bytes()),
                Some(Ok(Message::Close(_))) | None => this.read_closed = true,
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    this.read_closed = true
                }
                Some(Err(e)) => return Poll::Ready(Err(into_io(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.close_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        ready!(this.inner.poll_ready_unpin(cx)).map_err(into_io)?;
        this.inner
            .start_send_unpin(Message::Binary(buf.to_vec()))
            .map_err(into_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(this.inner.poll_flush_unpin(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) if this.close_sent => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(into_io(e))),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.close_sent = true;
        match ready!(this.inner.poll_close_unpin(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(WsError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(into_io(e))),
        }
    }
}
