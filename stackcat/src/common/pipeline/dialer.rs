// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::Instrument;

use super::spec::Authority;
use crate::common::driver::{ConnUpgrade, LayerId, Role, UpgradeError};
use crate::util::stream::{self, BoxedConnection};

#[derive(thiserror::Error, Debug)]
pub enum DialError {
  #[error("Connecting to {authority} failed")]
  Connect {
    authority: Authority,
    #[source]
    source: std::io::Error,
  },
  #[error(transparent)]
  Layer(#[from] UpgradeError),
}

impl DialError {
  /// The failing layer, if the transport itself connected
  pub fn layer(&self) -> Option<&LayerId> {
    match self {
      DialError::Connect { .. } => None,
      DialError::Layer(upgrade) => Some(&upgrade.layer),
    }
  }
}

/// Produces outbound connections to a given authority
pub trait Dialer: Send + Sync {
  fn dial(&self, authority: &Authority) -> BoxFuture<'static, Result<BoxedConnection, DialError>>;
}

pub type ArcDialer = Arc<dyn Dialer>;

/// The base transport every dialer pipeline starts from
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
  fn dial(&self, authority: &Authority) -> BoxFuture<'static, Result<BoxedConnection, DialError>> {
    let authority = authority.clone();
    async move {
      let connected = tokio::net::TcpStream::connect((authority.host.as_str(), authority.port)).await;
      match connected {
        Ok(stream) => {
          if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(?error, "failed to disable nagle on dialed stream");
          }
          tracing::trace!(peer = ?stream.peer_addr().ok(), "transport connected");
          Ok(stream::boxed(stream))
        }
        Err(source) => Err(DialError::Connect { authority, source }),
      }
    }
    .boxed()
  }
}

/// Adapts a conn-only layer to a dialer: every connection from `inner` is upgraded before it is returned
pub struct ConnUpgradeDialer {
  inner: ArcDialer,
  upgrade: Arc<dyn ConnUpgrade>,
  layer: LayerId,
}

impl ConnUpgradeDialer {
  pub fn new(inner: ArcDialer, upgrade: Arc<dyn ConnUpgrade>, layer: LayerId) -> Self {
    Self {
      inner,
      upgrade,
      layer,
    }
  }
}

impl Dialer for ConnUpgradeDialer {
  fn dial(&self, authority: &Authority) -> BoxFuture<'static, Result<BoxedConnection, DialError>> {
    let connecting = self.inner.dial(authority);
    let upgrade = self.upgrade.clone();
    let layer = self.layer.clone();
    let span = tracing::debug_span!("dial_upgrade", layer = %layer);
    async move {
      let conn = connecting.await?;
      // On failure the partially upgraded connection is dropped here, closing it
      let upgraded = upgrade
        .upgrade(conn, Role::Dialer)
        .await
        .map_err(|source| UpgradeError::new(layer, source))?;
      tracing::trace!("layer established");
      Ok(upgraded)
    }
    .instrument(span)
    .boxed()
  }
}

/// The fully composed dialer of a compiled pipeline
#[derive(Clone)]
pub struct ComposedDialer {
  inner: ArcDialer,
  layers: Arc<[LayerId]>,
}

impl ComposedDialer {
  pub(crate) fn new(inner: ArcDialer, layers: Vec<LayerId>) -> Self {
    Self {
      inner,
      layers: layers.into(),
    }
  }

  pub fn layers(&self) -> &[LayerId] {
    &self.layers
  }

  #[tracing::instrument(level = "debug", skip(self, authority), fields(%authority, layers = self.layers.len()))]
  pub async fn dial(&self, authority: &Authority) -> Result<BoxedConnection, DialError> {
    let result = self.inner.dial(authority).await;
    if let Err(error) = &result {
      tracing::debug!(%error, "dial failed");
    }
    result
  }
}

impl std::fmt::Debug for ComposedDialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ComposedDialer")
      .field("layers", &self.layers)
      .finish_non_exhaustive()
  }
}
