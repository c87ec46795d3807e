// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! AES-GCM records keyed from a shared secret
//!
//! Each side opens with a random salt. The key for a direction is derived from the shared
//! secret, both salts (dialer's first), and the sending side's role: traffic reflected back
//! at its sender fails authentication, and so does traffic replayed into another session.

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::driver::{
  ConnUpgrade, Driver, DriverError, HandshakeError, Params, Role, Upgrades,
};
use crate::util::sealed::{
  algorithm_for_key, derive_key, random_bytes, seal_stream, DirectionKey, SealError,
};
use crate::util::stream::{self, BoxedConnection};

const SALT_LEN: usize = 32;
const LABEL: &[u8] = b"stackcat aesgcm v1";

pub struct AesGcmDriver;

impl Driver for AesGcmDriver {
  fn build(&self, params: &Params, role: Role) -> Result<Upgrades, DriverError> {
    let mut reader = params.reader();
    let secret = reader.required_hex("key")?;
    algorithm_for_key(secret.len()).map_err(|e| DriverError::invalid("key", e))?;
    reader.finish()?;
    Ok(Upgrades::conn_only(role, AesGcmUpgrade { secret }))
  }
}

struct AesGcmUpgrade {
  secret: Vec<u8>,
}

fn role_label(role: Role) -> &'static [u8] {
  match role {
    Role::Listener => b"listener",
    Role::Dialer => b"dialer",
  }
}

fn session_salt(own: &[u8; SALT_LEN], peer: &[u8; SALT_LEN], role: Role) -> [u8; SALT_LEN * 2] {
  let (dialer, listener) = match role {
    Role::Dialer => (own, peer),
    Role::Listener => (peer, own),
  };
  let mut salt = [0u8; SALT_LEN * 2];
  salt[..SALT_LEN].copy_from_slice(dialer);
  salt[SALT_LEN..].copy_from_slice(listener);
  salt
}

fn direction_key(secret: &[u8], salt: &[u8], sender: Role) -> Result<DirectionKey, SealError> {
  let key = derive_key(secret, salt, &[LABEL, role_label(sender)], secret.len())?;
  DirectionKey::new(&key)
}

fn peer_of(role: Role) -> Role {
  match role {
    Role::Listener => Role::Dialer,
    Role::Dialer => Role::Listener,
  }
}

impl ConnUpgrade for AesGcmUpgrade {
  fn upgrade(
    &self,
    mut conn: BoxedConnection,
    role: Role,
  ) -> BoxFuture<'static, Result<BoxedConnection, HandshakeError>> {
    let secret = self.secret.clone();
    async move {
      let own_salt =
        random_bytes::<SALT_LEN>().map_err(|e| HandshakeError::Other(Box::new(e)))?;
      conn.write_all(&own_salt).await?;
      conn.flush().await?;
      let mut peer_salt = [0u8; SALT_LEN];
      conn.read_exact(&mut peer_salt).await?;
      let salt = session_salt(&own_salt, &peer_salt, role);
      let keys = direction_key(&secret, &salt, role)
        .and_then(|sealer| Ok((sealer, direction_key(&secret, &salt, peer_of(role))?)));
      let (sealer, opener) = keys.map_err(|e| HandshakeError::Other(Box::new(e)))?;
      Ok(stream::boxed(seal_stream(conn, sealer, opener)))
    }
    .boxed()
  }
}
