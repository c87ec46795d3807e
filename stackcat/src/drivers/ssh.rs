// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! One SSH session channel per connection, carried as a byte stream
//!
//! Listeners present `hostkey` and, when `password` is set, require it from every client.
//! Dialers log in as `user` and, given a `fingerprint`, accept only the host key whose
//! SHA-256 blob digest matches it.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use ring::digest;
use russh::server::{Auth, Msg as ServerMsg, Session};
use russh::Channel;
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::common::driver::{
  ConnUpgrade, Driver, DriverError, HandshakeError, ParamReader, Params, Role, Upgrades,
};
use crate::util::stream::{self, Anchored, BoxedConnection};

pub const FINGERPRINT_LEN: usize = 32;

/// SHA-256 of the wire encoding of a host's public key
pub fn host_key_fingerprint(key: &PublicKey) -> [u8; FINGERPRINT_LEN] {
  let mut fingerprint = [0u8; FINGERPRINT_LEN];
  fingerprint.copy_from_slice(digest::digest(&digest::SHA256, &key.public_key_bytes()).as_ref());
  fingerprint
}

pub struct SshDriver;

impl Driver for SshDriver {
  fn build(&self, params: &Params, role: Role) -> Result<Upgrades, DriverError> {
    let mut reader = params.reader();
    let upgrades = match role {
      Role::Listener => Upgrades::conn_only(role, SshListen::from_params(&mut reader)?),
      Role::Dialer => Upgrades::conn_only(role, SshConnect::from_params(&mut reader)?),
    };
    reader.finish()?;
    Ok(upgrades)
  }
}

fn ssh_error(error: russh::Error) -> HandshakeError {
  match error {
    russh::Error::UnknownKey => HandshakeError::Verification("host key was not accepted".into()),
    russh::Error::IO(error) => HandshakeError::Io(error),
    other => HandshakeError::Other(Box::new(other)),
  }
}

/// Aborts the session driving a server-side channel once that channel is dropped
struct SessionTask(JoinHandle<()>);

impl Drop for SessionTask {
  fn drop(&mut self) {
    self.0.abort();
  }
}

struct SshListen {
  config: Arc<russh::server::Config>,
  password: Option<String>,
}

impl SshListen {
  fn from_params(reader: &mut ParamReader<'_>) -> Result<Self, DriverError> {
    reader.reject("user", Role::Listener)?;
    reader.reject("fingerprint", Role::Listener)?;
    let pem = reader.required_hex("hostkey")?;
    let pem = String::from_utf8(pem).map_err(|_| DriverError::invalid("hostkey", "not PEM text"))?;
    let key: KeyPair =
      russh_keys::decode_secret_key(&pem, None).map_err(|e| DriverError::invalid("hostkey", e))?;
    let password = reader.optional("password").map(str::to_owned);
    let config = russh::server::Config {
      keys: vec![key],
      ..Default::default()
    };
    Ok(Self {
      config: Arc::new(config),
      password,
    })
  }
}

/// Accepts the first session channel and hands it to the waiting upgrade
struct ChannelAcceptor {
  password: Option<String>,
  channel: Option<oneshot::Sender<Channel<ServerMsg>>>,
}

#[async_trait::async_trait]
impl russh::server::Handler for ChannelAcceptor {
  type Error = russh::Error;

  async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
    if self.password.is_none() {
      tracing::trace!(user, "accepted without credentials");
      Ok(Auth::Accept)
    } else {
      Ok(Auth::Reject {
        proceed_with_methods: None,
      })
    }
  }

  async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
    match &self.password {
      Some(expected) if expected.as_bytes() != password.as_bytes() => {
        tracing::debug!(user, "rejected password");
        Ok(Auth::Reject {
          proceed_with_methods: None,
        })
      }
      _ => Ok(Auth::Accept),
    }
  }

  async fn channel_open_session(
    &mut self,
    channel: Channel<ServerMsg>,
    _session: &mut Session,
  ) -> Result<bool, Self::Error> {
    match self.channel.take() {
      Some(waiting) => Ok(waiting.send(channel).is_ok()),
      // One channel per connection
      None => Ok(false),
    }
  }
}

impl ConnUpgrade for SshListen {
  fn upgrade(
    &self,
    conn: BoxedConnection,
    _role: Role,
  ) -> BoxFuture<'static, Result<BoxedConnection, HandshakeError>> {
    let config = self.config.clone();
    let (channel_tx, channel_rx) = oneshot::channel();
    let handler = ChannelAcceptor {
      password: self.password.clone(),
      channel: Some(channel_tx),
    };
    async move {
      let running = russh::server::run_stream(config, conn, handler)
        .await
        .map_err(ssh_error)?;
      let task = SessionTask(tokio::spawn(async move {
        if let Err(error) = running.await {
          tracing::debug!(%error, "ssh session ended with an error");
        }
      }));
      // The sender is dropped with the handler if the session ends before a channel opens
      let channel = channel_rx.await.map_err(|_| {
        HandshakeError::Protocol("peer closed before opening a session channel".into())
      })?;
      tracing::trace!(channel = ?channel.id(), "ssh channel accepted");
      Ok(stream::boxed(Anchored::new(channel.into_stream(), task)))
    }
    .boxed()
  }
}

struct SshConnect {
  config: Arc<russh::client::Config>,
  user: String,
  password: Option<String>,
  fingerprint: Option<[u8; FINGERPRINT_LEN]>,
}

impl SshConnect {
  fn from_params(reader: &mut ParamReader<'_>) -> Result<Self, DriverError> {
    reader.reject("hostkey", Role::Dialer)?;
    let user = reader.required("user")?.to_owned();
    let password = reader.optional("password").map(str::to_owned);
    let fingerprint = reader
      .optional_hex("fingerprint")?
      .map(|digest| {
        <[u8; FINGERPRINT_LEN]>::try_from(digest.as_slice())
          .map_err(|_| DriverError::invalid("fingerprint", "must be a 32-byte SHA-256 digest"))
      })
      .transpose()?;
    Ok(Self {
      config: Arc::new(russh::client::Config::default()),
      user,
      password,
      fingerprint,
    })
  }
}

struct HostKeyCheck {
  fingerprint: Option<[u8; FINGERPRINT_LEN]>,
}

#[async_trait::async_trait]
impl russh::client::Handler for HostKeyCheck {
  type Error = russh::Error;

  async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
    let presented = host_key_fingerprint(server_public_key);
    match &self.fingerprint {
      Some(expected) => {
        let accepted = expected == &presented;
        if !accepted {
          tracing::debug!(presented = %hex::encode(presented), "host key does not match fingerprint");
        }
        Ok(accepted)
      }
      None => {
        tracing::warn!(presented = %hex::encode(presented), "accepting unpinned ssh host key");
        Ok(true)
      }
    }
  }
}

impl ConnUpgrade for SshConnect {
  fn upgrade(
    &self,
    conn: BoxedConnection,
    _role: Role,
  ) -> BoxFuture<'static, Result<BoxedConnection, HandshakeError>> {
    let config = self.config.clone();
    let user = self.user.clone();
    let password = self.password.clone();
    let handler = HostKeyCheck {
      fingerprint: self.fingerprint,
    };
    async move {
      let mut handle = russh::client::connect_stream(config, conn, handler)
        .await
        .map_err(ssh_error)?;
      let authenticated = match &password {
        Some(password) => handle.authenticate_password(user.as_str(), password).await,
        None => handle.authenticate_none(user.as_str()).await,
      }
      .map_err(ssh_error)?;
      if !authenticated {
        return Err(HandshakeError::Verification(format!(
          "server rejected credentials for `{}`",
          user
        )));
      }
      let channel = handle.channel_open_session().await.map_err(ssh_error)?;
      tracing::trace!(channel = ?channel.id(), "ssh channel opened");
      Ok(stream::boxed(Anchored::new(channel.into_stream(), handle)))
    }
    .boxed()
  }
}
