use bytes::{Buf, Bytes};
use std::future::Future;
use std::io::Error;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Run an I/O future under an optional timeout, mapping expiry to
/// `ErrorKind::TimedOut`.
pub(crate) async fn with_timeout<F, T>(timeout: Option<Duration>, fut: F) -> std::io::Result<T>
where
  F: Future<Output = std::io::Result<T>>,
{
  match timeout {
    None => fut.await,
    Some(t) => tokio::time::timeout(t, fut).await?,
  }
}

/// Upstream socket, plain or TLS, carrying per-operation timeouts
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl Socket {
  pub(crate) fn new(
    maybe_tls_stream: MaybeTlsStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner: maybe_tls_stream,
      read_timeout,
      write_timeout,
    }
  }

  pub(crate) async fn tls<F, Fut>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = Result<TlsStream<TcpStream>, Error>>,
  {
    match self.inner {
      MaybeTlsStream::Tcp(t) => Ok(Self {
        inner: MaybeTlsStream::Tls(Box::new(func(t).await?)),
        read_timeout: self.read_timeout,
        write_timeout: self.write_timeout,
      }),
      MaybeTlsStream::Tls(t) => Ok(Self {
        inner: MaybeTlsStream::Tls(t),
        read_timeout: self.read_timeout,
        write_timeout: self.write_timeout,
      }),
    }
  }

  /// Timeout applied to each read
  pub fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }

  /// Timeout applied to each write
  pub fn write_timeout(&self) -> Option<Duration> {
    self.write_timeout
  }
}

/// Plain TCP or client-role TLS over TCP
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

impl Socket {
  /// Attempts to write an entire buffer into this writer.
  pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    let timeout = self.write_timeout;
    with_timeout(timeout, AsyncWriteExt::write_all(self.deref_mut(), buf)).await
  }

  /// Flushes this output stream, ensuring that all intermediately buffered
  /// contents reach their destination.
  pub async fn flush(&mut self) -> std::io::Result<()> {
    let timeout = self.write_timeout;
    with_timeout(timeout, AsyncWriteExt::flush(self.deref_mut())).await
  }
}

impl Deref for Socket {
  type Target = MaybeTlsStream;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Socket {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

/// Combine a buffer with an IO, rewinding reads to use the buffer.
///
/// Bytes read ahead while sniffing the first request line are replayed
/// before anything else is read from the socket.
#[derive(Debug)]
pub struct Rewind<T> {
  pre: Option<Bytes>,
  inner: T,
}

impl<T> Rewind<T> {
  /// Wrap `io` so that `buf` is read first
  pub fn new_buffered(io: T, buf: Bytes) -> Self {
    Rewind {
      pre: if buf.is_empty() { None } else { Some(buf) },
      inner: io,
    }
  }
}

impl<T> AsyncRead for Rewind<T>
where
  T: AsyncRead + Unpin,
{
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if let Some(mut prefix) = self.pre.take() {
      if !prefix.is_empty() {
        let copy_len = std::cmp::min(prefix.len(), buf.remaining());
        buf.put_slice(&prefix[..copy_len]);
        prefix.advance(copy_len);
        if !prefix.is_empty() {
          self.pre = Some(prefix);
        }
        return Poll::Ready(Ok(()));
      }
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<T> AsyncWrite for Rewind<T>
where
  T: AsyncWrite + Unpin,
{
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn rewind_replays_prefix_before_inner() {
    let inner: &[u8] = b" world";
    let mut stream = Rewind::new_buffered(inner, Bytes::from_static(b"hello"));
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "hello world");
  }

  #[tokio::test]
  async fn timeouts_surface_as_timed_out() {
    let err = with_timeout(
      Some(Duration::from_millis(10)),
      std::future::pending::<std::io::Result<()>>(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
  }
}
