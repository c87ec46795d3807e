// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! AEAD-sealed records over a byte stream
//!
//! Each record is `u16 length || ciphertext || tag`, where the length prefix is bound
//! into the record as associated data. Nonces are per-direction record counters,
//! so a key must never be reused for two directions or two sessions.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ring::aead;
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use tokio_util::codec::{Decoder, Encoder};

use super::record::{RecordCodec, RecordStream};

pub const TAG_LEN: usize = 16;
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;
const LENGTH_PREFIX: usize = std::mem::size_of::<u16>();

#[derive(thiserror::Error, Debug)]
pub enum SealError {
  #[error("Key material must be 16 or 32 bytes, got {0}")]
  KeyLength(usize),
  #[error("Record sequence exhausted for this key")]
  SequenceExhausted,
  #[error("Record failed authentication")]
  Authentication,
  #[error("Record length {0} is outside the permitted range")]
  RecordLength(usize),
  #[error("Key derivation failure")]
  Derivation,
  #[error("Secure random source failure")]
  Random,
}

impl From<SealError> for io::Error {
  fn from(e: SealError) -> Self {
    io::Error::new(io::ErrorKind::InvalidData, e)
  }
}

pub fn algorithm_for_key(length: usize) -> Result<&'static aead::Algorithm, SealError> {
  match length {
    16 => Ok(&aead::AES_128_GCM),
    32 => Ok(&aead::AES_256_GCM),
    other => Err(SealError::KeyLength(other)),
  }
}

struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
  fn len(&self) -> usize {
    self.0
  }
}

/// HKDF-SHA256 extract-and-expand
pub fn derive_key(
  secret: &[u8],
  salt: &[u8],
  info: &[&[u8]],
  length: usize,
) -> Result<Vec<u8>, SealError> {
  let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(secret);
  let okm = prk
    .expand(info, HkdfLen(length))
    .map_err(|_| SealError::Derivation)?;
  let mut out = vec![0u8; length];
  okm.fill(&mut out).map_err(|_| SealError::Derivation)?;
  Ok(out)
}

pub fn random_bytes<const N: usize>() -> Result<[u8; N], SealError> {
  let mut bytes = [0u8; N];
  SystemRandom::new()
    .fill(&mut bytes)
    .map_err(|_| SealError::Random)?;
  Ok(bytes)
}

/// One direction of a sealed channel
pub struct DirectionKey {
  key: aead::LessSafeKey,
  sequence: u64,
}

impl DirectionKey {
  pub fn new(key: &[u8]) -> Result<Self, SealError> {
    let algorithm = algorithm_for_key(key.len())?;
    let unbound =
      aead::UnboundKey::new(algorithm, key).map_err(|_| SealError::KeyLength(key.len()))?;
    Ok(Self {
      key: aead::LessSafeKey::new(unbound),
      sequence: 0,
    })
  }

  fn next_nonce(&mut self) -> Result<aead::Nonce, SealError> {
    let sequence = self.sequence;
    self.sequence = sequence
      .checked_add(1)
      .ok_or(SealError::SequenceExhausted)?;
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce[aead::NONCE_LEN - 8..].copy_from_slice(&sequence.to_be_bytes());
    Ok(aead::Nonce::assume_unique_for_key(nonce))
  }
}

impl std::fmt::Debug for DirectionKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DirectionKey")
      .field("algorithm", self.key.algorithm())
      .field("sequence", &self.sequence)
      .finish_non_exhaustive()
  }
}

#[derive(Debug)]
pub struct SealCodec {
  sealer: DirectionKey,
  opener: DirectionKey,
}

impl SealCodec {
  pub fn new(sealer: DirectionKey, opener: DirectionKey) -> Self {
    Self { sealer, opener }
  }
}

impl Encoder<Bytes> for SealCodec {
  type Error = io::Error;

  fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
    if item.len() > MAX_RECORD_PAYLOAD {
      return Err(SealError::RecordLength(item.len()).into());
    }
    let length = item.len() + TAG_LEN;
    let prefix = (length as u16).to_be_bytes();
    let mut record = item.to_vec();
    let nonce = self.sealer.next_nonce()?;
    self
      .sealer
      .key
      .seal_in_place_append_tag(nonce, aead::Aad::from(prefix), &mut record)
      .map_err(|_| SealError::Authentication)?;
    dst.reserve(LENGTH_PREFIX + record.len());
    dst.put_slice(&prefix);
    dst.put_slice(&record);
    Ok(())
  }
}

impl Decoder for SealCodec {
  type Item = BytesMut;
  type Error = io::Error;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
    if src.len() < LENGTH_PREFIX {
      return Ok(None);
    }
    let prefix = [src[0], src[1]];
    let length = u16::from_be_bytes(prefix) as usize;
    if length < TAG_LEN || length > MAX_RECORD_PAYLOAD + TAG_LEN {
      return Err(SealError::RecordLength(length).into());
    }
    if src.len() < LENGTH_PREFIX + length {
      src.reserve(LENGTH_PREFIX + length - src.len());
      return Ok(None);
    }
    src.advance(LENGTH_PREFIX);
    let mut record = src.split_to(length);
    let nonce = self.opener.next_nonce()?;
    let plaintext_length = self
      .opener
      .key
      .open_in_place(nonce, aead::Aad::from(prefix), &mut record[..])
      .map_err(|_| SealError::Authentication)?
      .len();
    record.truncate(plaintext_length);
    Ok(Some(record))
  }
}

impl RecordCodec for SealCodec {
  fn max_payload(&self) -> usize {
    MAX_RECORD_PAYLOAD
  }
}

pub type SealedStream<S> = RecordStream<S, SealCodec>;

pub fn seal_stream<S>(inner: S, sealer: DirectionKey, opener: DirectionKey) -> SealedStream<S>
where
  S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
  RecordStream::new(inner, SealCodec::new(sealer, opener))
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{derive_key, seal_stream, DirectionKey, MAX_RECORD_PAYLOAD};

  fn keys(a: &[u8], b: &[u8]) -> (DirectionKey, DirectionKey) {
    (DirectionKey::new(a).unwrap(), DirectionKey::new(b).unwrap())
  }

  #[tokio::test]
  async fn sealed_streams_exchange_data_larger_than_a_record() {
    let (near, far) = tokio::io::duplex(4096);
    let up = [1u8; 32];
    let down = [2u8; 32];
    let (near_seal, near_open) = keys(&up, &down);
    let (far_seal, far_open) = keys(&down, &up);
    let mut near = seal_stream(near, near_seal, near_open);
    let mut far = seal_stream(far, far_seal, far_open);

    let payload: Vec<u8> = (0..(MAX_RECORD_PAYLOAD * 3 + 17))
      .map(|i| (i % 253) as u8)
      .collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
      near.write_all(&payload).await.unwrap();
      near.shutdown().await.unwrap();
      near
    });
    let mut received = Vec::new();
    far.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, expected);

    far.write_all(b"reply").await.unwrap();
    far.flush().await.unwrap();
    let mut near = writer.await.unwrap();
    let mut reply = [0u8; 5];
    near.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"reply");
  }

  #[tokio::test]
  async fn mismatched_keys_fail_authentication() {
    let (near, far) = tokio::io::duplex(4096);
    let (near_seal, near_open) = keys(&[1u8; 16], &[2u8; 16]);
    let (far_seal, far_open) = keys(&[2u8; 16], &[3u8; 16]);
    let mut near = seal_stream(near, near_seal, near_open);
    let mut far = seal_stream(far, far_seal, far_open);
    near.write_all(b"secret").await.unwrap();
    near.flush().await.unwrap();
    let mut buf = [0u8; 6];
    let error = far.read_exact(&mut buf).await.unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
  }

  #[tokio::test]
  async fn tampered_records_are_rejected() {
    let (near, mut far) = tokio::io::duplex(4096);
    let (seal, open) = keys(&[9u8; 32], &[8u8; 32]);
    let mut near = seal_stream(near, seal, open);
    near.write_all(b"hello").await.unwrap();
    near.flush().await.unwrap();
    let mut raw = [0u8; 2 + 5 + 16];
    far.read_exact(&mut raw).await.unwrap();
    raw[4] ^= 0x40;

    let (forged_near, mut forged_far) = tokio::io::duplex(4096);
    forged_far.write_all(&raw).await.unwrap();
    let (seal, open) = keys(&[8u8; 32], &[9u8; 32]);
    let mut receiver = seal_stream(forged_near, seal, open);
    let mut buf = [0u8; 5];
    assert!(receiver.read_exact(&mut buf).await.is_err());
  }

  #[test]
  fn derivation_separates_contexts() {
    let a = derive_key(b"secret", b"salt", &[b"one"], 32).unwrap();
    let b = derive_key(b"secret", b"salt", &[b"two"], 32).unwrap();
    assert_eq!(a.len(), 32);
    assert_ne!(a, b);
    assert_eq!(a, derive_key(b"secret", b"salt", &[b"one"], 32).unwrap());
  }

  #[test]
  fn only_aes_key_sizes_are_accepted() {
    assert!(DirectionKey::new(&[0u8; 16]).is_ok());
    assert!(DirectionKey::new(&[0u8; 32]).is_ok());
    assert!(DirectionKey::new(&[0u8; 24]).is_err());
  }
}
