// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::net::TcpListener;
use tracing::Instrument;

use super::spec::Authority;
use crate::common::driver::{ConnUpgrade, LayerId, Role, UpgradeError};
use crate::util::stream::{self, BoxedConnection};

/// An accepted transport connection whose layer handshakes have not yet run
///
/// Listeners hand these out as soon as the base transport accepts, so that
/// handshakes run on the task which will own the session, never inside the accept loop.
pub struct Incoming {
  peer: SocketAddr,
  handshake: BoxFuture<'static, Result<BoxedConnection, UpgradeError>>,
}

impl Incoming {
  pub fn new(peer: SocketAddr, conn: BoxedConnection) -> Self {
    Self {
      peer,
      handshake: futures::future::ready(Ok(conn)).boxed(),
    }
  }

  pub fn peer(&self) -> SocketAddr {
    self.peer
  }

  /// Appends an upgrade step, run after every step already queued
  pub fn then_upgrade<F, Fut>(self, upgrade: F) -> Self
  where
    F: FnOnce(BoxedConnection) -> Fut + Send + 'static,
    Fut: Future<Output = Result<BoxedConnection, UpgradeError>> + Send + 'static,
  {
    let previous = self.handshake;
    Self {
      peer: self.peer,
      handshake: async move {
        let conn = previous.await?;
        upgrade(conn).await
      }
      .boxed(),
    }
  }

  /// Runs every queued handshake in declared order
  pub async fn establish(self) -> Result<BoxedConnection, UpgradeError> {
    self.handshake.await
  }
}

impl std::fmt::Debug for Incoming {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Incoming")
      .field("peer", &self.peer)
      .finish_non_exhaustive()
  }
}

pub trait Listener: Send {
  /// Waits for the next inbound connection; errors returned here are fatal to the listener
  fn accept(&mut self) -> BoxFuture<'_, std::io::Result<Incoming>>;

  fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

pub type BoxedListener = Box<dyn Listener>;

/// Accept errors concerning a single peer, after which the listening socket remains usable
pub fn is_transient_accept_error(error: &std::io::Error) -> bool {
  use std::io::ErrorKind;
  matches!(
    error.kind(),
    ErrorKind::ConnectionAborted
      | ErrorKind::ConnectionReset
      | ErrorKind::ConnectionRefused
      | ErrorKind::Interrupted
      | ErrorKind::WouldBlock
      | ErrorKind::TimedOut
  )
}

/// The base transport every listener pipeline starts from
pub struct TcpListenerSource {
  listener: TcpListener,
}

impl TcpListenerSource {
  pub async fn bind(authority: &Authority) -> std::io::Result<Self> {
    let listener = TcpListener::bind((authority.host.as_str(), authority.port)).await?;
    Ok(Self { listener })
  }

  pub fn from_listener(listener: TcpListener) -> Self {
    Self { listener }
  }
}

impl Listener for TcpListenerSource {
  fn accept(&mut self) -> BoxFuture<'_, std::io::Result<Incoming>> {
    async move {
      loop {
        match self.listener.accept().await {
          Ok((stream, peer)) => {
            if let Err(error) = stream.set_nodelay(true) {
              tracing::debug!(?error, %peer, "failed to disable nagle on accepted stream");
            }
            return Ok(Incoming::new(peer, stream::boxed(stream)));
          }
          Err(error) if is_transient_accept_error(&error) => {
            tracing::debug!(?error, "transient accept failure");
          }
          Err(error) => return Err(error),
        }
      }
    }
    .boxed()
  }

  fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }
}

/// Adapts a conn-only layer to a listener: every accepted connection is queued for upgrade
pub struct ConnUpgradeListener {
  inner: BoxedListener,
  upgrade: Arc<dyn ConnUpgrade>,
  layer: LayerId,
}

impl ConnUpgradeListener {
  pub fn new(inner: BoxedListener, upgrade: Arc<dyn ConnUpgrade>, layer: LayerId) -> Self {
    Self {
      inner,
      upgrade,
      layer,
    }
  }
}

impl Listener for ConnUpgradeListener {
  fn accept(&mut self) -> BoxFuture<'_, std::io::Result<Incoming>> {
    async move {
      let incoming = self.inner.accept().await?;
      let upgrade = self.upgrade.clone();
      let layer = self.layer.clone();
      let span = tracing::debug_span!("accept_upgrade", layer = %layer, peer = %incoming.peer());
      Ok(incoming.then_upgrade(move |conn| {
        async move {
          let upgraded = upgrade
            .upgrade(conn, Role::Listener)
            .await
            .map_err(|source| UpgradeError::new(layer, source))?;
          tracing::trace!("layer established");
          Ok(upgraded)
        }
        .instrument(span)
      }))
    }
    .boxed()
  }

  fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.inner.local_addr()
  }
}

/// The fully composed listener of a compiled pipeline
pub struct ComposedListener {
  inner: BoxedListener,
  layers: Arc<[LayerId]>,
}

impl ComposedListener {
  pub(crate) fn new(inner: BoxedListener, layers: Vec<LayerId>) -> Self {
    Self {
      inner,
      layers: layers.into(),
    }
  }

  pub fn layers(&self) -> &[LayerId] {
    &self.layers
  }

  pub async fn accept(&mut self) -> std::io::Result<Incoming> {
    self.inner.accept().await
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.inner.local_addr()
  }
}

impl std::fmt::Debug for ComposedListener {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ComposedListener")
      .field("local_addr", &self.local_addr().ok())
      .field("layers", &self.layers)
      .finish()
  }
}
