// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub mod cancellation;
pub mod framed;
pub mod record;
pub mod sealed;
pub mod stream;
pub mod validators;

pub const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Upper bound on forwarding an end-of-stream to a peer which has stopped reading
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum CopyEnd {
  /// The reader reached end-of-stream
  Eof,
  /// The copy was stopped from outside, or by its sibling direction
  Closed,
  Failed(std::io::Error),
}

#[derive(Debug)]
pub struct CopyOutcome {
  pub bytes: u64,
  pub end: CopyEnd,
}

/// Copy from `reader` into `writer` until end-of-stream, failure, or cancellation of `close`
///
/// However the copy ends, `close` is cancelled on the way out, so a copy running
/// in the opposite direction under the same token stops with it.
#[tracing::instrument(level = "trace", skip_all)]
pub async fn copy_until_closed<R, W>(
  mut reader: R,
  mut writer: W,
  close: CancellationToken,
) -> CopyOutcome
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0u8; PROXY_BUFFER_CAPACITY];
  let mut bytes = 0u64;
  let end = loop {
    let read = tokio::select! {
      biased;
      _ = close.cancelled() => break CopyEnd::Closed,
      read = reader.read(&mut buffer) => read,
    };
    let length = match read {
      Ok(0) => break CopyEnd::Eof,
      Ok(length) => length,
      Err(e) => break CopyEnd::Failed(e),
    };
    let written = tokio::select! {
      biased;
      _ = close.cancelled() => break CopyEnd::Closed,
      written = async {
        writer.write_all(&buffer[..length]).await?;
        writer.flush().await
      } => written,
    };
    match written {
      Ok(()) => bytes += length as u64,
      Err(e) => break CopyEnd::Failed(e),
    }
  };
  if let CopyEnd::Eof = end {
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
  }
  close.cancel();
  tracing::trace!(bytes, end = ?end, "copy finished");
  CopyOutcome { bytes, end }
}
