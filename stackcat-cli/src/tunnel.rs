// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use stackcat::common::{
  driver::registry::DriverRegistry,
  pipeline::spec::EndpointSpec,
  tunnel::{Tunnel, TunnelOptions},
};
use tokio_util::sync::CancellationToken;

/// Parameters used to run a tunnel between two layered endpoints
#[derive(Clone, Debug)]
pub struct TunnelArgs {
  pub source: EndpointSpec,
  pub destination: EndpointSpec,
  pub options: TunnelOptions,
}

#[cfg(unix)]
async fn terminate_requested() -> std::io::Result<()> {
  let mut terminate =
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
  terminate.recv().await;
  Ok(())
}

#[cfg(not(unix))]
async fn terminate_requested() -> std::io::Result<()> {
  futures::future::pending().await
}

#[tracing::instrument(skip_all, err)]
pub async fn tunnel_main(config: self::TunnelArgs) -> Result<()> {
  let registry =
    Arc::new(DriverRegistry::with_builtin_drivers().context("Driver registration failed")?);

  let (shutdown, signal_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let signal_handler_task = tokio::task::spawn(async move {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT detected, initiating graceful shutdown"),
        _ = terminate_requested() => tracing::info!("SIGTERM detected, initiating graceful shutdown"),
      }
      shutdown_trigger.cancel();
    });
    (shutdown, signal_handler_task)
  };

  let tunnel = Tunnel::new(registry, config.source, config.destination, config.options);
  let outcome = tunnel.run(shutdown).await;

  signal_handler_task.abort();
  let _cancelled = signal_handler_task.await;

  let summary = outcome.context("Tunnel failed")?;
  tracing::info!(
    sessions = summary.sessions,
    forced_closed = summary.forced_closed,
    "tunnel exited"
  );
  Ok(())
}
