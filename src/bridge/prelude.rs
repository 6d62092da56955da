//! Keeps the first bytes read from a stream
//!
//! A tunnel that dies before pairing writes a one-line diagnostic where the
//! peer's SSH identification would be. An SSH client skips that line as
//! pre-banner text, so the bytes are kept here for whoever reports the
//! failure.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const PRELUDE_LIMIT: usize = 512;

pub struct PreludeTap<S> {
    inner: S,
    seen: Arc<Mutex<Vec<u8>>>,
}

/// Read side of a [`PreludeTap`], usable after the stream moved away
#[derive(Clone)]
pub struct Prelude {
    seen: Arc<Mutex<Vec<u8>>>,
}

impl<S> PreludeTap<S> {
    pub fn new(inner: S) -> (Self, Prelude) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let prelude = Prelude { seen: seen.clone() };
        (Self { inner, seen }, prelude)
    }
}

impl Prelude {
    /// First line received, unless it was an SSH identification string.
    pub fn notice(&self) -> Option<String> {
        let seen = self.seen.lock();
        let text = String::from_utf8_lossy(&seen);
        let line = text.lines().next()?.trim();
        if line.is_empty() || line.starts_with("SSH-") {
            return None;
        }
        Some(line.to_string())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PreludeTap<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &polled {
            let mut seen = this.seen.lock();
            let room = PRELUDE_LIMIT.saturating_sub(seen.len());
            let fresh = &buf.filled()[before..];
            seen.extend_from_slice(&fresh[..fresh.len().min(room)]);
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PreludeTap<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_notice_from_first_line() {
        let (near, mut far) = duplex(1024);
        let (mut tap, prelude) = PreludeTap::new(near);

        far.write_all(b"Device unreachable: device is offline\r\n").await.unwrap();
        drop(far);
        let mut out = Vec::new();
        tap.read_to_end(&mut out).await.unwrap();

        assert_eq!(prelude.notice().as_deref(), Some("Device unreachable: device is offline"));
    }

    #[tokio::test]
    async fn test_ssh_banner_is_not_a_notice() {
        let (near, mut far) = duplex(1024);
        let (mut tap, prelude) = PreludeTap::new(near);
        assert!(prelude.notice().is_none());

        far.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
        let mut buf = [0u8; 21];
        tap.read_exact(&mut buf).await.unwrap();
        assert!(prelude.notice().is_none());

        // writes pass straight through
        tap.write_all(b"hi").await.unwrap();
        let mut echo = [0u8; 2];
        far.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hi");
    }

    #[tokio::test]
    async fn test_capture_is_bounded() {
        let (near, mut far) = duplex(4096);
        let (mut tap, prelude) = PreludeTap::new(near);

        far.write_all(&[b'x'; 2048]).await.unwrap();
        drop(far);
        let mut out = Vec::new();
        tap.read_to_end(&mut out).await.unwrap();

        assert_eq!(out.len(), 2048);
        assert_eq!(prelude.notice().map(|line| line.len()), Some(PRELUDE_LIMIT));
    }
}
