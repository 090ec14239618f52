//! Push-back stream wrapper.
//!
//! Protocol sniffing needs to look at leading bytes without taking them away
//! from whoever handles the connection next. [`UnreadStream`] keeps a prefix
//! buffer in front of the inner reader; [`UnreadStream::unread`] prepends to
//! it, so nested peeks compose instead of overwriting each other.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// A stream with bytes pushed back in front of it.
#[derive(Debug)]
pub struct UnreadStream<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S> UnreadStream<S> {
    /// Wrap a stream with nothing pushed back.
    pub fn new(inner: S) -> Self {
        Self {
            prefix: BytesMut::new(),
            inner,
        }
    }

    /// Wrap a stream with `prefix` in front of it.
    pub fn with_prefix(inner: S, prefix: &[u8]) -> Self {
        Self {
            prefix: BytesMut::from(prefix),
            inner,
        }
    }

    /// Push bytes back so the next reads return them first, ahead of any
    /// bytes already pushed back.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut prefix = BytesMut::with_capacity(bytes.len() + self.prefix.len());
        prefix.extend_from_slice(bytes);
        prefix.extend_from_slice(&self.prefix);
        self.prefix = prefix;
    }

    /// Bytes currently pushed back.
    pub fn buffered(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap, returning the pushed-back bytes that were never read.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.inner, self.prefix)
    }
}

impl<S: AsyncRead + Unpin> UnreadStream<S> {
    /// Read up to `n` bytes and push them straight back.
    ///
    /// Returns fewer than `n` bytes only when the stream hits EOF first.
    pub async fn peek(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.read(&mut out[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        out.truncate(filled);
        self.unread(&out);
        Ok(out)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for UnreadStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for UnreadStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\x05hello").await.unwrap();
        drop(client);

        let mut stream = UnreadStream::new(server);
        assert_eq!(stream.peek(1).await.unwrap(), b"\x05");

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"\x05hello");
    }

    #[tokio::test]
    async fn test_nested_unread_prepends() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"tail").await.unwrap();
        drop(client);

        let mut stream = UnreadStream::with_prefix(server, b"middle-");
        stream.unread(b"head-");
        assert_eq!(stream.buffered(), b"head-middle-");

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"head-middle-tail");
    }

    #[tokio::test]
    async fn test_peek_twice_sees_same_bytes() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let mut stream = UnreadStream::new(server);
        assert_eq!(stream.peek(1).await.unwrap(), b"G");
        assert_eq!(stream.peek(3).await.unwrap(), b"GET");
        assert_eq!(stream.buffered(), b"GET");
    }

    #[tokio::test]
    async fn test_peek_short_on_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut stream = UnreadStream::new(server);
        assert!(stream.peek(4).await.unwrap().is_empty());
    }
}
