// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Byte stream disguised as DNS-over-TCP traffic
//!
//! Dialer writes travel as TXT queries whose QNAME carries the payload as hex labels
//! in front of the configured domain. Listener writes travel as TXT answers.
//! Both directions are independent; messages only look like queries and responses.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::common::driver::{
  ConnUpgrade, Driver, DriverError, HandshakeError, Params, Role, Upgrades,
};
use crate::util::record::{RecordCodec, RecordStream};
use crate::util::stream::{self, BoxedConnection};

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
/// Hex digits per data label, kept even so no byte straddles two labels
const DATA_LABEL_LEN: usize = 62;
const MAX_TXT_STRING: usize = 255;
const RESPONSE_STRINGS: usize = 4;
const TYPE_TXT: u16 = 16;
const CLASS_IN: u16 = 1;
const FLAGS_QUERY: u16 = 0x0100;
const FLAGS_RESPONSE: u16 = 0x8400;
const FLAG_QR: u16 = 0x8000;
const RCODE_MASK: u16 = 0x000f;
const POINTER_TO_QUESTION: u16 = 0xc000 | HEADER_LEN as u16;

pub struct DnsTunnelDriver;

impl Driver for DnsTunnelDriver {
  fn build(&self, params: &Params, role: Role) -> Result<Upgrades, DriverError> {
    let mut reader = params.reader();
    let domain = parse_domain(reader.required("domain")?)?;
    reader.finish()?;
    if query_capacity(&domain) == 0 {
      return Err(DriverError::invalid(
        "domain",
        "too long to leave room for payload labels",
      ));
    }
    Ok(Upgrades::conn_only(role, DnsTunnelUpgrade { domain }))
  }
}

fn parse_domain(domain: &str) -> Result<Vec<Vec<u8>>, DriverError> {
  let trimmed = domain.strip_suffix('.').unwrap_or(domain);
  let labels = trimmed
    .split('.')
    .map(|label| {
      let valid = !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && label
          .bytes()
          .all(|b| b.is_ascii_alphanumeric() || b == b'-');
      if valid {
        Ok(label.to_ascii_lowercase().into_bytes())
      } else {
        Err(DriverError::invalid(
          "domain",
          format!("`{}` is not a valid DNS label", label),
        ))
      }
    })
    .collect::<Result<Vec<_>, _>>()?;
  Ok(labels)
}

fn encoded_name_len(labels: &[Vec<u8>]) -> usize {
  labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
}

/// Payload bytes one query can carry in front of `domain`
fn query_capacity(domain: &[Vec<u8>]) -> usize {
  let available = MAX_NAME_LEN.saturating_sub(encoded_name_len(domain));
  let full_labels = available / (DATA_LABEL_LEN + 1);
  let remainder = available % (DATA_LABEL_LEN + 1);
  full_labels * (DATA_LABEL_LEN / 2) + remainder.saturating_sub(1) / 2
}

struct DnsTunnelUpgrade {
  domain: Vec<Vec<u8>>,
}

impl ConnUpgrade for DnsTunnelUpgrade {
  fn upgrade(
    &self,
    conn: BoxedConnection,
    role: Role,
  ) -> BoxFuture<'static, Result<BoxedConnection, HandshakeError>> {
    let codec = DnsCodec::new(self.domain.clone(), role);
    futures::future::ready(Ok(stream::boxed(RecordStream::new(conn, codec)))).boxed()
  }
}

fn malformed(reason: impl Into<String>) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

fn take<'a>(message: &mut &'a [u8], length: usize) -> io::Result<&'a [u8]> {
  if message.len() < length {
    return Err(malformed("truncated DNS message"));
  }
  let (taken, rest) = message.split_at(length);
  *message = rest;
  Ok(taken)
}

fn take_u16(message: &mut &[u8]) -> io::Result<u16> {
  take(message, 2).map(|mut b| b.get_u16())
}

/// Reads an uncompressed name as its list of labels
fn read_name<'a>(message: &mut &'a [u8]) -> io::Result<Vec<&'a [u8]>> {
  let mut labels = Vec::new();
  loop {
    let length = take(message, 1)?[0] as usize;
    if length == 0 {
      return Ok(labels);
    }
    if length > MAX_LABEL_LEN {
      return Err(malformed("compressed or oversized label in query name"));
    }
    labels.push(take(message, length)?);
  }
}

/// Steps over a name which may end in a compression pointer
fn skip_name(message: &mut &[u8]) -> io::Result<()> {
  loop {
    let length = take(message, 1)?[0];
    match length {
      0 => return Ok(()),
      l if l & 0xc0 == 0xc0 => {
        take(message, 1)?;
        return Ok(());
      }
      l if l as usize > MAX_LABEL_LEN => return Err(malformed("invalid label length")),
      l => {
        take(message, l as usize)?;
      }
    }
  }
}

/// Writes queries and reads answers as a dialer; the reverse as a listener
pub struct DnsCodec {
  domain: Vec<Vec<u8>>,
  role: Role,
  capacity: usize,
  next_id: u16,
}

impl DnsCodec {
  fn new(domain: Vec<Vec<u8>>, role: Role) -> Self {
    let capacity = query_capacity(&domain);
    Self {
      domain,
      role,
      capacity,
      next_id: 0,
    }
  }

  fn header(&mut self, dst: &mut BytesMut, flags: u16, answers: u16) {
    dst.put_u16(self.next_id);
    self.next_id = self.next_id.wrapping_add(1);
    dst.put_u16(flags);
    dst.put_u16(1);
    dst.put_u16(answers);
    dst.put_u16(0);
    dst.put_u16(0);
  }

  fn put_domain(&self, dst: &mut BytesMut) {
    for label in &self.domain {
      dst.put_u8(label.len() as u8);
      dst.put_slice(label);
    }
    dst.put_u8(0);
  }

  fn encode_query(&mut self, payload: &[u8], message: &mut BytesMut) {
    self.header(message, FLAGS_QUERY, 0);
    let digits = hex::encode(payload);
    for label in digits.as_bytes().chunks(DATA_LABEL_LEN) {
      message.put_u8(label.len() as u8);
      message.put_slice(label);
    }
    self.put_domain(message);
    message.put_u16(TYPE_TXT);
    message.put_u16(CLASS_IN);
  }

  fn encode_response(&mut self, payload: &[u8], message: &mut BytesMut) {
    self.header(message, FLAGS_RESPONSE, 1);
    self.put_domain(message);
    message.put_u16(TYPE_TXT);
    message.put_u16(CLASS_IN);
    message.put_u16(POINTER_TO_QUESTION);
    message.put_u16(TYPE_TXT);
    message.put_u16(CLASS_IN);
    message.put_u32(0);
    let strings = payload.chunks(MAX_TXT_STRING);
    let rdata_len = payload.len() + strings.len();
    message.put_u16(rdata_len as u16);
    for string in strings {
      message.put_u8(string.len() as u8);
      message.put_slice(string);
    }
  }

  fn decode_query(&self, mut message: &[u8]) -> io::Result<BytesMut> {
    let header = take(&mut message, HEADER_LEN)?;
    let flags = u16::from_be_bytes([header[2], header[3]]);
    let questions = u16::from_be_bytes([header[4], header[5]]);
    if flags & FLAG_QR != 0 || questions != 1 {
      return Err(malformed("expected a single-question query"));
    }
    let labels = read_name(&mut message)?;
    let record_type = take_u16(&mut message)?;
    if record_type != TYPE_TXT {
      return Err(malformed(format!("unexpected query type {}", record_type)));
    }
    let data_labels = labels.len().checked_sub(self.domain.len());
    let in_domain = data_labels.map_or(false, |n| {
      labels[n..]
        .iter()
        .zip(&self.domain)
        .all(|(label, expected)| label.eq_ignore_ascii_case(expected))
    });
    let data_labels = match data_labels {
      Some(n) if in_domain => n,
      _ => return Err(malformed("query outside the tunnel domain")),
    };
    let digits: Vec<u8> = labels[..data_labels].concat();
    let payload = hex::decode(digits).map_err(|e| malformed(e.to_string()))?;
    Ok(BytesMut::from(&payload[..]))
  }

  fn decode_response(&self, mut message: &[u8]) -> io::Result<BytesMut> {
    let header = take(&mut message, HEADER_LEN)?;
    let flags = u16::from_be_bytes([header[2], header[3]]);
    if flags & FLAG_QR == 0 {
      return Err(malformed("expected a response"));
    }
    if flags & RCODE_MASK != 0 {
      return Err(malformed(format!(
        "response carries error code {}",
        flags & RCODE_MASK
      )));
    }
    let questions = u16::from_be_bytes([header[4], header[5]]);
    let answers = u16::from_be_bytes([header[6], header[7]]);
    for _ in 0..questions {
      skip_name(&mut message)?;
      take(&mut message, 4)?;
    }
    let mut payload = BytesMut::new();
    for _ in 0..answers {
      skip_name(&mut message)?;
      let record_type = take_u16(&mut message)?;
      take(&mut message, 6)?;
      let rdata_len = take_u16(&mut message)? as usize;
      let mut rdata = take(&mut message, rdata_len)?;
      if record_type != TYPE_TXT {
        continue;
      }
      while !rdata.is_empty() {
        let length = take(&mut rdata, 1)?[0] as usize;
        payload.put_slice(take(&mut rdata, length)?);
      }
    }
    Ok(payload)
  }
}

impl Decoder for DnsCodec {
  type Item = BytesMut;
  type Error = io::Error;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
    if src.len() < 2 {
      return Ok(None);
    }
    let length = u16::from_be_bytes([src[0], src[1]]) as usize;
    if src.len() < 2 + length {
      src.reserve(2 + length - src.len());
      return Ok(None);
    }
    src.advance(2);
    let message = src.split_to(length);
    let payload = match self.role {
      Role::Listener => self.decode_query(&message)?,
      Role::Dialer => self.decode_response(&message)?,
    };
    Ok(Some(payload))
  }
}

impl Encoder<Bytes> for DnsCodec {
  type Error = io::Error;

  fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
    let mut message = BytesMut::new();
    match self.role {
      Role::Dialer => self.encode_query(&item, &mut message),
      Role::Listener => self.encode_response(&item, &mut message),
    }
    let length = u16::try_from(message.len())
      .map_err(|_| malformed(format!("DNS message of {} bytes", message.len())))?;
    dst.reserve(2 + message.len());
    dst.put_u16(length);
    dst.extend_from_slice(&message);
    Ok(())
  }
}

impl RecordCodec for DnsCodec {
  fn max_payload(&self) -> usize {
    match self.role {
      Role::Dialer => self.capacity,
      Role::Listener => MAX_TXT_STRING * RESPONSE_STRINGS,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::io::ErrorKind;

  use bytes::{Bytes, BytesMut};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio_util::codec::{Decoder, Encoder};

  use super::{parse_domain, query_capacity, DnsCodec, DnsTunnelDriver, MAX_NAME_LEN};
  use crate::common::driver::{Driver, DriverError, Role};
  use crate::drivers::test_support::{assert_carries, handshake_pair, params};

  #[tokio::test]
  async fn payloads_cross_in_both_directions() {
    let listener = DnsTunnelDriver
      .build(&params(&[("domain", "t.example.com")]), Role::Listener)
      .unwrap();
    let dialer = DnsTunnelDriver
      .build(&params(&[("domain", "T.Example.com.")]), Role::Dialer)
      .unwrap();
    let (accepted, dialed) = handshake_pair(&listener, &dialer).await;
    let (mut accepted, mut dialed) = (accepted.unwrap(), dialed.unwrap());
    let upstream: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    assert_carries(&mut dialed, &mut accepted, &upstream).await;
    assert_carries(&mut accepted, &mut dialed, &upstream).await;
  }

  #[test]
  fn queries_stay_within_name_limits() {
    let domain = parse_domain("t.example.com").unwrap();
    let capacity = query_capacity(&domain);
    let mut dialer = DnsCodec::new(domain.clone(), Role::Dialer);
    let mut listener = DnsCodec::new(domain, Role::Listener);
    let payload = Bytes::from(vec![0xabu8; capacity]);
    let mut wire = BytesMut::new();
    dialer.encode(payload.clone(), &mut wire).unwrap();
    // Length prefix, header, name, type and class
    let name_len = wire.len() - 2 - 12 - 4;
    assert!(name_len <= MAX_NAME_LEN);
    assert_eq!(&wire[14..16], &[62, b'a']);
    let decoded = listener.decode(&mut wire).unwrap().unwrap();
    assert_eq!(&decoded[..], &payload[..]);
    assert!(wire.is_empty());
  }

  #[test]
  fn queries_for_other_domains_are_rejected() {
    let mut dialer = DnsCodec::new(parse_domain("a.example.com").unwrap(), Role::Dialer);
    let mut listener = DnsCodec::new(parse_domain("b.example.com").unwrap(), Role::Listener);
    let mut wire = BytesMut::new();
    dialer.encode(Bytes::from_static(b"hi"), &mut wire).unwrap();
    let error = listener.decode(&mut wire).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidData);
  }

  #[tokio::test]
  async fn partial_messages_wait_for_more_bytes() {
    let domain = parse_domain("t.example.com").unwrap();
    let mut listener = DnsCodec::new(domain.clone(), Role::Listener);
    let mut dialer = DnsCodec::new(domain, Role::Dialer);
    let mut wire = BytesMut::new();
    listener
      .encode(Bytes::from_static(b"answer"), &mut wire)
      .unwrap();
    let mut partial = wire.split_to(wire.len() - 1);
    assert!(dialer.decode(&mut partial).unwrap().is_none());
    partial.unsplit(wire);
    let decoded = dialer.decode(&mut partial).unwrap().unwrap();
    assert_eq!(&decoded[..], b"answer");

    let (near, mut far) = tokio::io::duplex(1024);
    let upgrades = DnsTunnelDriver
      .build(&params(&[("domain", "t.example.com")]), Role::Listener)
      .unwrap();
    let mut conn = upgrades
      .conn()
      .unwrap()
      .upgrade(Box::new(near), Role::Listener)
      .await
      .unwrap();
    far.write_all(&[0, 40, 1, 2]).await.unwrap();
    drop(far);
    let mut rest = Vec::new();
    assert!(conn.read_to_end(&mut rest).await.is_err());
  }

  #[test]
  fn domains_are_validated() {
    assert!(matches!(
      DnsTunnelDriver.build(&params(&[]), Role::Dialer),
      Err(DriverError::MissingParameter { ref param }) if param == "domain"
    ));
    assert!(matches!(
      DnsTunnelDriver.build(&params(&[("domain", "bad..example")]), Role::Listener),
      Err(DriverError::Invalid { ref param, .. }) if param == "domain"
    ));
    assert!(matches!(
      DnsTunnelDriver.build(&params(&[("domain", "under_score.test")]), Role::Listener),
      Err(DriverError::Invalid { ref param, .. }) if param == "domain"
    ));
    let long = vec!["a".repeat(63); 4].join(".");
    assert!(matches!(
      DnsTunnelDriver.build(&params(&[("domain", long.as_str())]), Role::Dialer),
      Err(DriverError::Invalid { ref param, .. }) if param == "domain"
    ));
  }
}
