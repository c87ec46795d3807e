// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Compiles layer specifications into composed dialers, listeners, and connection pipelines
//!
//! Declared order is handshake order on the wire: the first layer of a stack runs its
//! handshake directly over the transport, and each later layer runs inside the previous one.
//! Compilation opens no sockets; [Pipeline::bind] is the only operation here that does.

use std::sync::Arc;

use crate::common::driver::registry::DriverRegistry;
use crate::common::driver::{
  ConnUpgrade, DialerCapabilities, DriverError, LayerId, ListenerCapabilities, Role, UpgradeError,
  Upgrades, Wrapper,
};
use crate::util::stream::BoxedConnection;

pub mod dialer;
pub mod listener;
pub mod spec;

use dialer::{ArcDialer, ComposedDialer, ConnUpgradeDialer, TcpDialer};
use listener::{BoxedListener, ComposedListener, ConnUpgradeListener, TcpListenerSource};
use spec::{Authority, EndpointSpec, LayerSpec};

#[derive(thiserror::Error, Debug)]
pub enum CompileError {
  #[error("Layer #{index} names unknown driver `{name}`")]
  UnknownDriver { index: usize, name: String },
  #[error("Layer {layer} rejected its configuration")]
  Driver {
    layer: LayerId,
    #[source]
    source: DriverError,
  },
  #[error("Layer {layer} produced {found} capabilities when asked for a {expected}")]
  RoleMismatch {
    layer: LayerId,
    expected: Role,
    found: Role,
  },
  #[error("Layer {layer} cannot upgrade an established connection")]
  MissingCapability { layer: LayerId },
  #[error("Pipeline compiled for a {found} cannot be used as a {expected}")]
  WrongPipelineRole { expected: Role, found: Role },
}

#[derive(thiserror::Error, Debug)]
pub enum BindError {
  #[error(transparent)]
  Compile(#[from] CompileError),
  #[error("Binding {authority} failed")]
  Io {
    authority: Authority,
    #[source]
    source: std::io::Error,
  },
}

/// An ordered, immutable chain of wrappers sharing one role
#[derive(Clone, Debug)]
pub struct Pipeline {
  role: Role,
  wrappers: Arc<[Wrapper]>,
}

impl Pipeline {
  /// Builds every layer in declared order, failing atomically on the first error
  #[tracing::instrument(level = "debug", skip_all, fields(%role, layers = layers.len()))]
  pub fn compile(
    registry: &DriverRegistry,
    layers: &[LayerSpec],
    role: Role,
  ) -> Result<Self, CompileError> {
    let mut wrappers = Vec::with_capacity(layers.len());
    for (index, spec) in layers.iter().enumerate() {
      let layer = LayerId::new(index, spec.name.as_str());
      let driver = registry
        .lookup(&spec.name)
        .map_err(|_| CompileError::UnknownDriver {
          index,
          name: spec.name.clone(),
        })?;
      let upgrades = driver
        .build(&spec.params, role)
        .map_err(|source| CompileError::Driver {
          layer: layer.clone(),
          source,
        })?;
      if upgrades.role() != role {
        return Err(CompileError::RoleMismatch {
          layer,
          expected: role,
          found: upgrades.role(),
        });
      }
      tracing::trace!(%layer, params = ?spec.params, ?upgrades, "layer built");
      wrappers.push(Wrapper {
        layer,
        params: spec.params.clone(),
        upgrades,
      });
    }
    Ok(Self {
      role,
      wrappers: wrappers.into(),
    })
  }

  pub fn compile_endpoint(
    registry: &DriverRegistry,
    endpoint: &EndpointSpec,
  ) -> Result<Self, CompileError> {
    Self::compile(registry, &endpoint.layers, endpoint.role.driver_role())
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn wrappers(&self) -> &[Wrapper] {
    &self.wrappers
  }

  pub fn layer_ids(&self) -> Vec<LayerId> {
    self.wrappers.iter().map(|w| w.layer.clone()).collect()
  }

  fn expect_role(&self, expected: Role) -> Result<(), CompileError> {
    if self.role == expected {
      Ok(())
    } else {
      Err(CompileError::WrongPipelineRole {
        expected,
        found: self.role,
      })
    }
  }

  /// Composes the pipeline over plain TCP dialing
  pub fn dialer(&self) -> Result<ComposedDialer, CompileError> {
    self.dialer_over(Arc::new(TcpDialer))
  }

  pub fn dialer_over(&self, base: ArcDialer) -> Result<ComposedDialer, CompileError> {
    self.expect_role(Role::Dialer)?;
    let mut current = base;
    for wrapper in self.wrappers.iter() {
      let layer = wrapper.layer.clone();
      current = match &wrapper.upgrades {
        Upgrades::Dialer(DialerCapabilities::Dial(dial))
        | Upgrades::Dialer(DialerCapabilities::Both { dial, .. }) => {
          dial.upgrade_dialer(current, layer)
        }
        Upgrades::Dialer(DialerCapabilities::Conn(conn)) => {
          Arc::new(ConnUpgradeDialer::new(current, conn.clone(), layer))
        }
        Upgrades::Listener(_) => {
          return Err(CompileError::RoleMismatch {
            layer,
            expected: Role::Dialer,
            found: Role::Listener,
          })
        }
      };
    }
    Ok(ComposedDialer::new(current, self.layer_ids()))
  }

  pub fn listener_over(&self, base: BoxedListener) -> Result<ComposedListener, CompileError> {
    self.expect_role(Role::Listener)?;
    let mut current = base;
    for wrapper in self.wrappers.iter() {
      let layer = wrapper.layer.clone();
      current = match &wrapper.upgrades {
        Upgrades::Listener(ListenerCapabilities::Listen(listen))
        | Upgrades::Listener(ListenerCapabilities::Both { listen, .. }) => {
          listen.upgrade_listener(current, layer)
        }
        Upgrades::Listener(ListenerCapabilities::Conn(conn)) => {
          Box::new(ConnUpgradeListener::new(current, conn.clone(), layer))
        }
        Upgrades::Dialer(_) => {
          return Err(CompileError::RoleMismatch {
            layer,
            expected: Role::Listener,
            found: Role::Dialer,
          })
        }
      };
    }
    Ok(ComposedListener::new(current, self.layer_ids()))
  }

  /// Binds the base TCP listener and composes the pipeline over it
  #[tracing::instrument(level = "debug", skip(self, authority), fields(%authority))]
  pub async fn bind(&self, authority: &Authority) -> Result<ComposedListener, BindError> {
    self.expect_role(Role::Listener)?;
    let base = TcpListenerSource::bind(authority)
      .await
      .map_err(|source| BindError::Io {
        authority: authority.clone(),
        source,
      })?;
    Ok(self.listener_over(Box::new(base))?)
  }

  /// Composes every layer's conn-upgrade, for use over connections established elsewhere
  pub fn conn_pipeline(&self) -> Result<ConnPipeline, CompileError> {
    let steps = self
      .wrappers
      .iter()
      .map(|wrapper| {
        wrapper
          .upgrades
          .conn()
          .cloned()
          .map(|conn| (wrapper.layer.clone(), conn))
          .ok_or_else(|| CompileError::MissingCapability {
            layer: wrapper.layer.clone(),
          })
      })
      .collect::<Result<Vec<_>, _>>()?;
    Ok(ConnPipeline {
      role: self.role,
      steps: steps.into(),
    })
  }
}

/// Sequential conn-upgrades of every layer, in declared order
#[derive(Clone)]
pub struct ConnPipeline {
  role: Role,
  steps: Arc<[(LayerId, Arc<dyn ConnUpgrade>)]>,
}

impl ConnPipeline {
  pub fn role(&self) -> Role {
    self.role
  }

  #[tracing::instrument(level = "debug", skip_all, fields(role = %self.role, layers = self.steps.len()))]
  pub async fn upgrade(&self, conn: BoxedConnection) -> Result<BoxedConnection, UpgradeError> {
    let mut conn = conn;
    for (layer, upgrade) in self.steps.iter() {
      conn = upgrade
        .upgrade(conn, self.role)
        .await
        .map_err(|source| UpgradeError::new(layer.clone(), source))?;
      tracing::trace!(%layer, "layer established");
    }
    Ok(conn)
  }
}

impl std::fmt::Debug for ConnPipeline {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let layers: Vec<&LayerId> = self.steps.iter().map(|(layer, _)| layer).collect();
    f.debug_struct("ConnPipeline")
      .field("role", &self.role)
      .field("layers", &layers)
      .finish()
  }
}
