// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A duplex byte stream abstracting over a connection, allowing layers to be
/// stacked over TCP sockets, memory streams, TLS sessions, and SSH channels alike
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedConnection = Box<dyn Connection + 'static>;

pub fn boxed<C: Connection + 'static>(conn: C) -> BoxedConnection {
  Box::new(conn)
}

/// A connection which keeps an auxiliary value alive for as long as the stream is in use
///
/// Used by layers whose streams are driven by a background session, where
/// dropping the session handle would tear the stream down underneath its reader.
pub struct Anchored<S, A> {
  stream: Pin<Box<S>>,
  _anchor: A,
}

impl<S, A> Anchored<S, A> {
  pub fn new(stream: S, anchor: A) -> Self {
    Self {
      stream: Box::pin(stream),
      _anchor: anchor,
    }
  }
}

impl<S: AsyncRead, A> AsyncRead for Anchored<S, A> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    self.get_mut().stream.as_mut().poll_read(cx, buf)
  }
}

impl<S: AsyncWrite, A> AsyncWrite for Anchored<S, A> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    self.get_mut().stream.as_mut().poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.get_mut().stream.as_mut().poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.get_mut().stream.as_mut().poll_shutdown(cx)
  }
}

impl<S, A> Unpin for Anchored<S, A> {}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Arc;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{boxed, Anchored};

  struct DropFlag(Arc<AtomicBool>);

  impl Drop for DropFlag {
    fn drop(&mut self) {
      self.0.store(true, Ordering::SeqCst);
    }
  }

  #[tokio::test]
  async fn anchor_lives_as_long_as_stream() {
    let dropped = Arc::new(AtomicBool::new(false));
    let (near, mut far) = tokio::io::duplex(64);
    let mut conn = boxed(Anchored::new(near, DropFlag(dropped.clone())));
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert!(!dropped.load(Ordering::SeqCst));
    drop(conn);
    assert!(dropped.load(Ordering::SeqCst));
  }
}
