//! Low-level connection plumbing: byte accounting, SOCKS5, and the
//! tactic-racing dialer.

pub mod dialer;
pub mod socks5;

pub use dialer::Dialer;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::core::bytecounter::ByteCounter;

/// Stream wrapper charging every byte moved to the session counter.
#[derive(Debug)]
pub struct CountingStream<S> {
    inner: S,
    counter: Arc<ByteCounter>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, counter: Arc<ByteCounter>) -> Self {
        Self { inner, counter }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = buf.filled().len() - before;
            this.counter.count_received(read as u64);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            this.counter.count_sent(*written as u64);
        }
        poll
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counting_stream_charges_both_directions() {
        let (client, mut server) = tokio::io::duplex(256);
        let counter = Arc::new(ByteCounter::new());
        let mut counted = CountingStream::new(client, counter.clone());

        counted.write_all(b"ping!").await.unwrap();
        counted.flush().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping!");

        server.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        counted.read_exact(&mut buf).await.unwrap();

        assert_eq!(counter.bytes_sent(), 5);
        assert_eq!(counter.bytes_received(), 4);
    }
}
