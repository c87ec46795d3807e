// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Byte-stream adapter for layers which carry application data in discrete records
//!
//! A [RecordCodec] decides how plaintext chunks are wrapped on the wire; [RecordStream]
//! turns the resulting framed transport back into an ordinary [AsyncRead]/[AsyncWrite].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::{ready, Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::{Decoder, Encoder, Framed};

pub trait RecordCodec:
  Decoder<Item = BytesMut, Error = io::Error> + Encoder<Bytes, Error = io::Error>
{
  /// Largest plaintext chunk a single record may carry
  fn max_payload(&self) -> usize;
}

pub struct RecordStream<S, C> {
  framed: Framed<S, C>,
  pending: BytesMut,
}

impl<S, C> RecordStream<S, C>
where
  S: AsyncRead + AsyncWrite,
  C: RecordCodec,
{
  pub fn new(inner: S, codec: C) -> Self {
    Self {
      framed: Framed::new(inner, codec),
      pending: BytesMut::new(),
    }
  }

  pub fn codec(&self) -> &C {
    self.framed.codec()
  }
}

impl<S, C> AsyncRead for RecordStream<S, C>
where
  S: AsyncRead + AsyncWrite + Unpin,
  C: RecordCodec + Unpin,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    while this.pending.is_empty() {
      match ready!(Pin::new(&mut this.framed).poll_next(cx)) {
        Some(Ok(record)) => this.pending = record,
        Some(Err(e)) => return Poll::Ready(Err(e)),
        // Clean end-of-stream at a record boundary
        None => return Poll::Ready(Ok(())),
      }
    }
    let length = std::cmp::min(buf.remaining(), this.pending.len());
    buf.put_slice(&this.pending[..length]);
    this.pending.advance(length);
    Poll::Ready(Ok(()))
  }
}

impl<S, C> AsyncWrite for RecordStream<S, C>
where
  S: AsyncRead + AsyncWrite + Unpin,
  C: RecordCodec + Unpin,
{
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    if buf.is_empty() {
      return Poll::Ready(Ok(0));
    }
    let this = self.get_mut();
    ready!(Sink::<Bytes>::poll_ready(Pin::new(&mut this.framed), cx))?;
    let length = std::cmp::min(buf.len(), this.framed.codec().max_payload());
    Sink::<Bytes>::start_send(
      Pin::new(&mut this.framed),
      Bytes::copy_from_slice(&buf[..length]),
    )?;
    Poll::Ready(Ok(length))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Sink::<Bytes>::poll_flush(Pin::new(&mut self.get_mut().framed), cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Sink::<Bytes>::poll_close(Pin::new(&mut self.get_mut().framed), cx)
  }
}
