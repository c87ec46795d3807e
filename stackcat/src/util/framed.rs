// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Length-prefixed frames for the small fixed exchanges performed during layer handshakes

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: ::std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame of {0} bytes cannot be described by its length prefix")]
  TooLong(usize),
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
}

impl From<ReadError> for std::io::Error {
  fn from(e: ReadError) -> Self {
    match e {
      ReadError::UnexpectedEnd { error, .. } => error,
      other @ ReadError::MaxLengthExceeded { .. } => {
        std::io::Error::new(std::io::ErrorKind::InvalidData, other)
      }
    }
  }
}

impl From<WriteError> for std::io::Error {
  fn from(e: WriteError) -> Self {
    match e {
      WriteError::UnexpectedEnd(error) => error,
      other @ WriteError::TooLong(_) => std::io::Error::new(std::io::ErrorKind::InvalidInput, other),
    }
  }
}

pub async fn read_frame<T: tokio::io::AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  use tokio::io::AsyncReadExt;
  let length = s
    .read_u32()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

pub async fn write_frame<T: tokio::io::AsyncWrite + Unpin>(
  mut s: T,
  buffer: &[u8],
) -> Result<(), WriteError> {
  use tokio::io::AsyncWriteExt;
  let length = u32::try_from(buffer.len()).map_err(|_| WriteError::TooLong(buffer.len()))?;
  s.write_u32(length).await?;
  s.write_all(buffer).await?;
  Ok(s.flush().await?)
}

#[cfg(test)]
mod tests {
  use super::{read_frame, write_frame, ReadError};

  #[tokio::test]
  async fn stream_framed_roundtrip() {
    const TEST_BLOB_LENGTH: usize = 1234;
    let test_data: Vec<u8> = (0..TEST_BLOB_LENGTH).map(|x| (x % 251) as u8).collect();
    let mut buffer: Vec<u8> = Vec::new();
    write_frame(&mut buffer, &test_data)
      .await
      .expect("Writing frame to stream must succeed");
    // Stream must receive content of equal length to a u32 plus that of the content
    assert_eq!(buffer.len(), TEST_BLOB_LENGTH + std::mem::size_of::<u32>());
    assert_eq!(&buffer[std::mem::size_of::<u32>()..], &test_data[..]);
    let deserialized = read_frame(&buffer[..], None)
      .await
      .expect("Reading frame from stream must succeed");
    assert_eq!(test_data, deserialized);

    // Zero-length frames are legal
    buffer.clear();
    write_frame(&mut buffer, &[]).await.unwrap();
    assert!(read_frame(&buffer[..], None).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn oversized_frame_is_refused_before_reading_content() {
    let mut buffer: Vec<u8> = Vec::new();
    write_frame(&mut buffer, &[7u8; 300]).await.unwrap();
    match read_frame(&buffer[..], Some(256)).await {
      Err(ReadError::MaxLengthExceeded { expected, received }) => {
        assert_eq!(expected, 256);
        assert_eq!(received, 300);
      }
      other => panic!("Expected length rejection, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn truncated_frame_reports_missing_content() {
    let mut buffer: Vec<u8> = Vec::new();
    write_frame(&mut buffer, b"handshake").await.unwrap();
    buffer.truncate(6);
    assert!(matches!(
      read_frame(&buffer[..], None).await,
      Err(ReadError::UnexpectedEnd { .. })
    ));
  }
}
