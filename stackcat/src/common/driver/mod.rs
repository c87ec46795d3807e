// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The contract between pipelines and the drivers which build their layers
//!
//! A [Driver] validates a layer's parameters for one [Role] and returns the set of
//! [Upgrades] it can perform. All parameter and key-material validation happens in
//! [Driver::build]; once built, upgrades only fail for runtime reasons (I/O, peer
//! verification, protocol violations).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::common::pipeline::dialer::ArcDialer;
use crate::common::pipeline::listener::BoxedListener;
use crate::util::stream::BoxedConnection;

pub mod registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
  Listener,
  Dialer,
}

impl Display for Role {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Role::Listener => f.write_str("listener"),
      Role::Dialer => f.write_str("dialer"),
    }
  }
}

/// String parameters for a single layer
///
/// Values frequently carry key material, so the [Debug] representation lists keys only.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Params {
  entries: BTreeMap<String, String>,
}

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the previous value if the key was already present
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
    self.entries.insert(key.into(), value.into())
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.entries.get(key).map(String::as_str)
  }

  pub fn contains_key(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn reader(&self) -> ParamReader<'_> {
    ParamReader {
      params: self,
      consumed: BTreeSet::new(),
    }
  }
}

impl Debug for Params {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_set().entries(self.keys()).finish()
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
  fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
    Self {
      entries: iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    }
  }
}

/// Tracks which parameters a driver has consumed, so leftovers can be rejected
pub struct ParamReader<'a> {
  params: &'a Params,
  consumed: BTreeSet<&'a str>,
}

impl<'a> ParamReader<'a> {
  pub fn optional(&mut self, key: &'a str) -> Option<&'a str> {
    self.consumed.insert(key);
    self.params.get(key)
  }

  pub fn required(&mut self, key: &'a str) -> Result<&'a str, DriverError> {
    match self.optional(key) {
      None => Err(DriverError::MissingParameter {
        param: key.to_owned(),
      }),
      Some("") => Err(DriverError::Invalid {
        param: key.to_owned(),
        reason: "must not be empty".into(),
      }),
      Some(value) => Ok(value),
    }
  }

  pub fn optional_hex(&mut self, key: &'a str) -> Result<Option<Vec<u8>>, DriverError> {
    self
      .optional(key)
      .map(|value| decode_hex(key, value))
      .transpose()
  }

  pub fn required_hex(&mut self, key: &'a str) -> Result<Vec<u8>, DriverError> {
    let value = self.required(key)?;
    decode_hex(key, value)
  }

  /// Fails if `key` is present, as it has no meaning in `role`
  pub fn reject(&mut self, key: &'a str, role: Role) -> Result<(), DriverError> {
    self.consumed.insert(key);
    if self.params.contains_key(key) {
      Err(DriverError::IncompatibleParameter {
        param: key.to_owned(),
        role,
      })
    } else {
      Ok(())
    }
  }

  /// Fails on the first parameter no accessor asked for
  pub fn finish(self) -> Result<(), DriverError> {
    match self.params.keys().find(|k| !self.consumed.contains(k)) {
      Some(unknown) => Err(DriverError::UnknownParameter {
        param: unknown.to_owned(),
      }),
      None => Ok(()),
    }
  }
}

fn decode_hex(key: &str, value: &str) -> Result<Vec<u8>, DriverError> {
  hex::decode(value).map_err(|source| DriverError::Decode {
    param: key.to_owned(),
    source,
  })
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
  #[error("Missing required parameter `{param}`")]
  MissingParameter { param: String },
  #[error("Unknown parameter `{param}`")]
  UnknownParameter { param: String },
  #[error("Parameter `{param}` cannot be used by a {role}")]
  IncompatibleParameter { param: String, role: Role },
  #[error("Driver cannot act as a {role}")]
  RoleIncompatible { role: Role },
  #[error("Parameter `{param}` is not valid hex")]
  Decode {
    param: String,
    #[source]
    source: hex::FromHexError,
  },
  #[error("Parameter `{param}` is invalid: {reason}")]
  Invalid { param: String, reason: String },
  #[error("Driver is not supported by this build: {reason}")]
  Unsupported { reason: String },
}

impl DriverError {
  pub fn invalid(param: &str, reason: impl Display) -> Self {
    Self::Invalid {
      param: param.to_owned(),
      reason: reason.to_string(),
    }
  }
}

/// Position and driver name of a layer within its stack
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerId {
  pub index: usize,
  pub name: String,
}

impl LayerId {
  pub fn new(index: usize, name: impl Into<String>) -> Self {
    Self {
      index,
      name: name.into(),
    }
  }
}

impl Display for LayerId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{} ({})", self.index, self.name)
  }
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("I/O failure during handshake: {0}")]
  Io(#[from] std::io::Error),
  #[error("Peer failed verification: {0}")]
  Verification(String),
  #[error("Protocol violation: {0}")]
  Protocol(String),
  #[error("Handshake failure: {0}")]
  Other(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl HandshakeError {
  pub fn is_verification(&self) -> bool {
    matches!(self, Self::Verification(_))
  }
}

#[derive(thiserror::Error, Debug)]
#[error("Layer {layer} failed to upgrade its connection")]
pub struct UpgradeError {
  pub layer: LayerId,
  #[source]
  pub source: HandshakeError,
}

impl UpgradeError {
  pub fn new(layer: LayerId, source: impl Into<HandshakeError>) -> Self {
    Self {
      layer,
      source: source.into(),
    }
  }
}

/// Transforms an established connection into a new one by running a handshake over it
pub trait ConnUpgrade: Send + Sync {
  fn upgrade(
    &self,
    conn: BoxedConnection,
    role: Role,
  ) -> BoxFuture<'static, Result<BoxedConnection, HandshakeError>>;
}

/// Produces a dialer whose connections carry this layer over those of `inner`
pub trait DialerUpgrade: Send + Sync {
  fn upgrade_dialer(&self, inner: ArcDialer, layer: LayerId) -> ArcDialer;
}

/// Produces a listener whose accepted connections carry this layer over those of `inner`
pub trait ListenerUpgrade: Send + Sync {
  fn upgrade_listener(&self, inner: BoxedListener, layer: LayerId) -> BoxedListener;
}

#[derive(Clone)]
pub enum ListenerCapabilities {
  Listen(Arc<dyn ListenerUpgrade>),
  Conn(Arc<dyn ConnUpgrade>),
  Both {
    listen: Arc<dyn ListenerUpgrade>,
    conn: Arc<dyn ConnUpgrade>,
  },
}

impl ListenerCapabilities {
  pub fn listen(&self) -> Option<&Arc<dyn ListenerUpgrade>> {
    match self {
      Self::Listen(listen) | Self::Both { listen, .. } => Some(listen),
      Self::Conn(_) => None,
    }
  }

  pub fn conn(&self) -> Option<&Arc<dyn ConnUpgrade>> {
    match self {
      Self::Conn(conn) | Self::Both { conn, .. } => Some(conn),
      Self::Listen(_) => None,
    }
  }
}

#[derive(Clone)]
pub enum DialerCapabilities {
  Dial(Arc<dyn DialerUpgrade>),
  Conn(Arc<dyn ConnUpgrade>),
  Both {
    dial: Arc<dyn DialerUpgrade>,
    conn: Arc<dyn ConnUpgrade>,
  },
}

impl DialerCapabilities {
  pub fn dial(&self) -> Option<&Arc<dyn DialerUpgrade>> {
    match self {
      Self::Dial(dial) | Self::Both { dial, .. } => Some(dial),
      Self::Conn(_) => None,
    }
  }

  pub fn conn(&self) -> Option<&Arc<dyn ConnUpgrade>> {
    match self {
      Self::Conn(conn) | Self::Both { conn, .. } => Some(conn),
      Self::Dial(_) => None,
    }
  }
}

/// What a driver produced for one role; a listener-role build never yields dialer capabilities
#[derive(Clone)]
pub enum Upgrades {
  Listener(ListenerCapabilities),
  Dialer(DialerCapabilities),
}

impl Upgrades {
  pub fn role(&self) -> Role {
    match self {
      Self::Listener(_) => Role::Listener,
      Self::Dialer(_) => Role::Dialer,
    }
  }

  pub fn conn(&self) -> Option<&Arc<dyn ConnUpgrade>> {
    match self {
      Self::Listener(capabilities) => capabilities.conn(),
      Self::Dialer(capabilities) => capabilities.conn(),
    }
  }

  /// Capabilities for a layer which only knows how to upgrade established connections
  pub fn conn_only<C: ConnUpgrade + 'static>(role: Role, upgrade: C) -> Self {
    let upgrade: Arc<dyn ConnUpgrade> = Arc::new(upgrade);
    match role {
      Role::Listener => Self::Listener(ListenerCapabilities::Conn(upgrade)),
      Role::Dialer => Self::Dialer(DialerCapabilities::Conn(upgrade)),
    }
  }
}

impl Debug for Upgrades {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kinds = match self {
      Self::Listener(ListenerCapabilities::Listen(_)) => "listen",
      Self::Listener(ListenerCapabilities::Conn(_)) | Self::Dialer(DialerCapabilities::Conn(_)) => {
        "conn"
      }
      Self::Listener(ListenerCapabilities::Both { .. }) => "listen+conn",
      Self::Dialer(DialerCapabilities::Dial(_)) => "dial",
      Self::Dialer(DialerCapabilities::Both { .. }) => "dial+conn",
    };
    write!(f, "Upgrades({}: {})", self.role(), kinds)
  }
}

/// A compiled layer: the driver's upgrades together with where and how they were configured
#[derive(Clone, Debug)]
pub struct Wrapper {
  pub layer: LayerId,
  pub params: Params,
  pub upgrades: Upgrades,
}

impl Wrapper {
  pub fn role(&self) -> Role {
    self.upgrades.role()
  }

  pub fn name(&self) -> &str {
    &self.layer.name
  }
}

/// Builds layers from parameters
///
/// Drivers are stateless between builds; a driver may refuse a role outright by
/// returning [DriverError::RoleIncompatible].
#[cfg_attr(test, mockall::automock)]
pub trait Driver: Send + Sync {
  fn build(&self, params: &Params, role: Role) -> Result<Upgrades, DriverError>;
}
