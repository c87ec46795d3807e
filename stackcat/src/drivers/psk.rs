// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Mutually authenticated secure channel keyed by a pre-shared secret
//!
//! This is stackcat's own record protocol, not TLS 1.3 PSK, and does not interoperate
//! with TLS stacks. The dialer opens with its identity as a `u32` length-prefixed frame and
//! a 32-byte nonce, the listener answers with its own nonce, and both derive per-direction
//! AES-256-GCM keys from the secret with HKDF-SHA256.
//! Each side then proves possession of the secret with a sealed confirmation record,
//! the dialer first; no application data moves before both confirmations verify.

use std::io;

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::driver::{
  ConnUpgrade, Driver, DriverError, HandshakeError, Params, Role, Upgrades,
};
use crate::util::framed::{read_frame, write_frame};
use crate::util::sealed::{derive_key, random_bytes, seal_stream, DirectionKey, SealError};
use crate::util::stream::{self, BoxedConnection};

const NONCE_LEN: usize = 32;
const KEY_LEN: usize = 32;
const MAX_IDENTITY_LEN: usize = 1024;
const PROTOCOL_LABEL: &[u8] = b"stackcat psk v1";
const CLIENT_FINISHED: &[u8] = b"psk client finished";
const SERVER_FINISHED: &[u8] = b"psk server finished";

pub struct PskDriver;

impl Driver for PskDriver {
  fn build(&self, params: &Params, role: Role) -> Result<Upgrades, DriverError> {
    let mut reader = params.reader();
    let secret = reader.required_hex("key")?;
    let side = match role {
      Role::Listener => Side::Listener {
        expected_identity: reader.optional("identity").map(|i| i.as_bytes().to_vec()),
      },
      Role::Dialer => Side::Dialer {
        identity: reader.required("identity")?.as_bytes().to_vec(),
      },
    };
    if let Side::Dialer { identity } | Side::Listener { expected_identity: Some(identity) } = &side
    {
      if identity.len() > MAX_IDENTITY_LEN {
        return Err(DriverError::invalid("identity", "longer than 1024 bytes"));
      }
    }
    reader.finish()?;
    Ok(Upgrades::conn_only(role, PskUpgrade { secret, side }))
  }
}

enum Side {
  Listener { expected_identity: Option<Vec<u8>> },
  Dialer { identity: Vec<u8> },
}

struct PskUpgrade {
  secret: Vec<u8>,
  side: Side,
}

struct SessionKeys {
  client_write: DirectionKey,
  server_write: DirectionKey,
}

fn session_keys(
  secret: &[u8],
  identity: &[u8],
  client_nonce: &[u8; NONCE_LEN],
  server_nonce: &[u8; NONCE_LEN],
) -> Result<SessionKeys, SealError> {
  let mut salt = [0u8; NONCE_LEN * 2];
  salt[..NONCE_LEN].copy_from_slice(client_nonce);
  salt[NONCE_LEN..].copy_from_slice(server_nonce);
  let key = |direction: &[u8]| {
    derive_key(secret, &salt, &[PROTOCOL_LABEL, identity, direction], KEY_LEN)
      .and_then(|key| DirectionKey::new(&key))
  };
  Ok(SessionKeys {
    client_write: key(b"client write")?,
    server_write: key(b"server write")?,
  })
}

fn internal(error: SealError) -> HandshakeError {
  HandshakeError::Other(Box::new(error))
}

/// Failures reading a confirmation mean the peer holds a different secret
fn confirmation_error(error: io::Error) -> HandshakeError {
  match error.kind() {
    io::ErrorKind::InvalidData => {
      HandshakeError::Verification("key confirmation record failed authentication".into())
    }
    io::ErrorKind::UnexpectedEof => {
      HandshakeError::Verification("peer closed the connection during key confirmation".into())
    }
    _ => HandshakeError::Io(error),
  }
}

async fn expect_confirmation<S: tokio::io::AsyncRead + Unpin>(
  stream: &mut S,
  expected: &[u8],
) -> Result<(), HandshakeError> {
  let mut received = vec![0u8; expected.len()];
  stream
    .read_exact(&mut received)
    .await
    .map_err(confirmation_error)?;
  if received != expected {
    return Err(HandshakeError::Protocol(
      "unexpected key confirmation content".into(),
    ));
  }
  Ok(())
}

impl PskUpgrade {
  async fn dial(
    secret: Vec<u8>,
    identity: Vec<u8>,
    mut conn: BoxedConnection,
  ) -> Result<BoxedConnection, HandshakeError> {
    let client_nonce = random_bytes::<NONCE_LEN>().map_err(internal)?;
    write_frame(&mut conn, &identity)
      .await
      .map_err(io::Error::from)?;
    conn.write_all(&client_nonce).await?;
    conn.flush().await?;
    let mut server_nonce = [0u8; NONCE_LEN];
    conn.read_exact(&mut server_nonce).await?;

    let keys =
      session_keys(&secret, &identity, &client_nonce, &server_nonce).map_err(internal)?;
    let mut sealed = seal_stream(conn, keys.client_write, keys.server_write);
    sealed.write_all(CLIENT_FINISHED).await?;
    sealed.flush().await?;
    expect_confirmation(&mut sealed, SERVER_FINISHED).await?;
    tracing::trace!("psk channel established");
    Ok(stream::boxed(sealed))
  }

  async fn accept(
    secret: Vec<u8>,
    expected_identity: Option<Vec<u8>>,
    mut conn: BoxedConnection,
  ) -> Result<BoxedConnection, HandshakeError> {
    let identity = read_frame(&mut conn, Some(MAX_IDENTITY_LEN))
      .await
      .map_err(io::Error::from)?;
    if let Some(expected) = &expected_identity {
      if &identity != expected {
        return Err(HandshakeError::Verification(format!(
          "unexpected identity {:?}",
          String::from_utf8_lossy(&identity)
        )));
      }
    }
    let mut client_nonce = [0u8; NONCE_LEN];
    conn.read_exact(&mut client_nonce).await?;
    let server_nonce = random_bytes::<NONCE_LEN>().map_err(internal)?;
    conn.write_all(&server_nonce).await?;
    conn.flush().await?;

    let keys =
      session_keys(&secret, &identity, &client_nonce, &server_nonce).map_err(internal)?;
    let mut sealed = seal_stream(conn, keys.server_write, keys.client_write);
    expect_confirmation(&mut sealed, CLIENT_FINISHED).await?;
    sealed.write_all(SERVER_FINISHED).await?;
    sealed.flush().await?;
    tracing::trace!(identity = %String::from_utf8_lossy(&identity), "psk channel accepted");
    Ok(stream::boxed(sealed))
  }
}

impl ConnUpgrade for PskUpgrade {
  fn upgrade(
    &self,
    conn: BoxedConnection,
    _role: Role,
  ) -> BoxFuture<'static, Result<BoxedConnection, HandshakeError>> {
    let secret = self.secret.clone();
    match &self.side {
      Side::Dialer { identity } => Self::dial(secret, identity.clone(), conn).boxed(),
      Side::Listener { expected_identity } => {
        Self::accept(secret, expected_identity.clone(), conn).boxed()
      }
    }
  }
}
