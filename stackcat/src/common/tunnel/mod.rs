// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Relays connections between a source endpoint and a destination endpoint
//!
//! A tunnel moves through `Initializing -> Running -> Draining -> Stopped`. Compilation of
//! both endpoints happens before any socket is opened; a listening source then runs one
//! session task per accepted connection, while a dialing source runs exactly one session.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::common::driver::registry::DriverRegistry;
use crate::common::driver::UpgradeError;
use crate::common::pipeline::dialer::{ComposedDialer, DialError};
use crate::common::pipeline::listener::{ComposedListener, Incoming};
use crate::common::pipeline::spec::{Authority, EndpointRole, EndpointSpec};
use crate::common::pipeline::{BindError, CompileError, Pipeline};
use crate::util::cancellation::CancellationListener;

pub mod id;
pub mod session;

use id::MonotonicAtomicGenerator;
use session::RelaySession;

#[derive(Debug, Clone)]
pub struct TunnelOptions {
  /// How long live sessions may continue after shutdown begins
  pub grace_period: Duration,
  /// Bound on the source handshake plus destination dial of each session
  pub handshake_timeout: Option<Duration>,
}

impl Default for TunnelOptions {
  fn default() -> Self {
    Self {
      grace_period: Duration::from_secs(5),
      handshake_timeout: Some(Duration::from_secs(30)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
  Initializing,
  /// `listening` carries the bound address when the source listens
  Running {
    listening: Option<SocketAddr>,
  },
  Draining,
  Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSide {
  Source,
  Destination,
}

impl std::fmt::Display for EndpointSide {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EndpointSide::Source => f.write_str("source"),
      EndpointSide::Destination => f.write_str("destination"),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
  #[error("The {side} endpoint failed to compile")]
  Compile {
    side: EndpointSide,
    #[source]
    source: CompileError,
  },
  #[error("The source listener could not be bound")]
  Bind(#[source] BindError),
  #[error("The source listener failed")]
  Listener(#[source] std::io::Error),
  #[error("Dialing the source failed")]
  SourceDial(#[source] DialError),
  #[error("Dialing the destination failed")]
  DestinationDial(#[source] DialError),
  #[error("The session was not established within {0:?}")]
  TimedOut(Duration),
}

/// Why a single session was abandoned before relaying
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Source handshake failed")]
  Source(#[source] UpgradeError),
  #[error("Destination dial failed")]
  Destination(#[source] DialError),
  #[error("Session was not established within {0:?}")]
  TimedOut(Duration),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSummary {
  /// Sessions started, whether or not they were established
  pub sessions: u64,
  /// Sessions still live when the grace period ran out
  pub forced_closed: usize,
}

pub struct Tunnel {
  registry: Arc<DriverRegistry>,
  source: EndpointSpec,
  destination: EndpointSpec,
  options: TunnelOptions,
  state: watch::Sender<TunnelState>,
  session_ids: MonotonicAtomicGenerator,
}

impl Tunnel {
  pub fn new(
    registry: Arc<DriverRegistry>,
    source: EndpointSpec,
    destination: EndpointSpec,
    options: TunnelOptions,
  ) -> Self {
    let (state, _) = watch::channel(TunnelState::Initializing);
    Self {
      registry,
      source,
      destination,
      options,
      state,
      session_ids: MonotonicAtomicGenerator::default(),
    }
  }

  pub fn state(&self) -> watch::Receiver<TunnelState> {
    self.state.subscribe()
  }

  /// Runs until `shutdown` fires and every session has drained, or until a fatal error
  ///
  /// The state is `Stopped` once this returns, whatever the outcome.
  #[tracing::instrument(name = "tunnel", skip_all, fields(source = %self.source, destination = %self.destination))]
  pub async fn run(
    &self,
    shutdown: impl Into<CancellationListener>,
  ) -> Result<TunnelSummary, TunnelError> {
    let shutdown = shutdown.into();
    let result = self.run_to_completion(&shutdown).await;
    self.state.send_replace(TunnelState::Stopped);
    match &result {
      Ok(summary) => tracing::info!(
        sessions = summary.sessions,
        forced_closed = summary.forced_closed,
        "tunnel stopped"
      ),
      Err(error) => tracing::error!(?error, "tunnel failed"),
    }
    result
  }

  async fn run_to_completion(
    &self,
    shutdown: &CancellationListener,
  ) -> Result<TunnelSummary, TunnelError> {
    let source =
      Pipeline::compile_endpoint(&self.registry, &self.source).map_err(|source| {
        TunnelError::Compile {
          side: EndpointSide::Source,
          source,
        }
      })?;
    let destination = Pipeline::compile_endpoint(&self.registry, &self.destination)
      .and_then(|pipeline| pipeline.dialer())
      .map_err(|source| TunnelError::Compile {
        side: EndpointSide::Destination,
        source,
      })?;
    let destination = Arc::new(destination);

    match self.source.role {
      EndpointRole::Listen => {
        let listener = source
          .bind(&self.source.authority)
          .await
          .map_err(TunnelError::Bind)?;
        self.serve(listener, destination, shutdown).await
      }
      EndpointRole::Dial => {
        let dialer = source.dialer().map_err(|source| TunnelError::Compile {
          side: EndpointSide::Source,
          source,
        })?;
        self.connect(dialer, destination, shutdown).await
      }
    }
  }

  async fn serve(
    &self,
    mut listener: ComposedListener,
    destination: Arc<ComposedDialer>,
    shutdown: &CancellationListener,
  ) -> Result<TunnelSummary, TunnelError> {
    let listening = listener.local_addr().ok();
    self.state.send_replace(TunnelState::Running { listening });
    tracing::info!(?listening, "accepting connections");

    let tracker = TaskTracker::new();
    let force_close = CancellationToken::new();
    let mut summary = TunnelSummary::default();
    let fatal = loop {
      let incoming = tokio::select! {
        biased;
        _ = shutdown.cancelled() => break None,
        incoming = listener.accept() => incoming,
      };
      match incoming {
        Ok(incoming) => {
          summary.sessions += 1;
          let id = self.session_ids.next();
          let span = tracing::info_span!("session", %id, peer = %incoming.peer());
          tracker.spawn(
            establish_and_relay(
              incoming,
              destination.clone(),
              self.destination.authority.clone(),
              shutdown.clone(),
              force_close.child_token(),
              self.options.handshake_timeout,
            )
            .instrument(span),
          );
        }
        Err(error) => break Some(error),
      }
    };
    // Stop accepting before waiting on sessions
    drop(listener);

    summary.forced_closed = self.drain(&tracker, &force_close).await;
    match fatal {
      None => Ok(summary),
      Some(error) => Err(TunnelError::Listener(error)),
    }
  }

  async fn connect(
    &self,
    source: ComposedDialer,
    destination: Arc<ComposedDialer>,
    shutdown: &CancellationListener,
  ) -> Result<TunnelSummary, TunnelError> {
    self
      .state
      .send_replace(TunnelState::Running { listening: None });
    let establish = async {
      let accepted = source
        .dial(&self.source.authority)
        .await
        .map_err(TunnelError::SourceDial)?;
      let dialed = destination
        .dial(&self.destination.authority)
        .await
        .map_err(TunnelError::DestinationDial)?;
      Ok::<_, TunnelError>((accepted, dialed))
    };
    let (accepted, dialed) = tokio::select! {
      biased;
      _ = shutdown.cancelled() => {
        tracing::info!("shutdown requested before the session was established");
        self.state.send_replace(TunnelState::Draining);
        return Ok(TunnelSummary::default());
      }
      established = within(self.options.handshake_timeout, establish, TunnelError::TimedOut) => {
        established?
      }
    };

    let tracker = TaskTracker::new();
    let force_close = CancellationToken::new();
    let id = self.session_ids.next();
    tracker.spawn(
      RelaySession::new(accepted, dialed)
        .run(force_close.child_token())
        .instrument(tracing::info_span!("session", %id)),
    );
    tracker.close();
    tokio::select! {
      _ = tracker.wait() => {},
      _ = shutdown.cancelled() => {},
    }
    let forced_closed = self.drain(&tracker, &force_close).await;
    Ok(TunnelSummary {
      sessions: 1,
      forced_closed,
    })
  }

  /// Waits out the grace period, then force-closes whatever remains; returns the number force-closed
  async fn drain(&self, tracker: &TaskTracker, force_close: &CancellationToken) -> usize {
    self.state.send_replace(TunnelState::Draining);
    tracker.close();
    if !tracker.is_empty() {
      tracing::info!(
        live = tracker.len(),
        grace = ?self.options.grace_period,
        "draining sessions"
      );
    }
    if tokio::time::timeout(self.options.grace_period, tracker.wait())
      .await
      .is_ok()
    {
      return 0;
    }
    let remaining = tracker.len();
    tracing::warn!(remaining, "grace period elapsed; force-closing sessions");
    force_close.cancel();
    tracker.wait().await;
    remaining
  }
}

async fn establish_and_relay(
  incoming: Incoming,
  destination: Arc<ComposedDialer>,
  authority: Authority,
  shutdown: CancellationListener,
  force_close: CancellationToken,
  handshake_timeout: Option<Duration>,
) {
  let establish = async {
    let accepted = incoming.establish().await.map_err(SessionError::Source)?;
    let dialed = destination
      .dial(&authority)
      .await
      .map_err(SessionError::Destination)?;
    Ok::<_, SessionError>((accepted, dialed))
  };
  let established = tokio::select! {
    biased;
    _ = shutdown.cancelled() => {
      tracing::debug!("shutdown requested during establishment");
      return;
    }
    established = within(handshake_timeout, establish, SessionError::TimedOut) => established,
  };
  match established {
    Ok((accepted, dialed)) => {
      tracing::debug!("session established");
      RelaySession::new(accepted, dialed).run(force_close).await;
    }
    Err(error) => tracing::warn!(?error, "session abandoned"),
  }
}

async fn within<T, E>(
  limit: Option<Duration>,
  establish: impl Future<Output = Result<T, E>>,
  timed_out: fn(Duration) -> E,
) -> Result<T, E> {
  match limit {
    None => establish.await,
    Some(limit) => tokio::time::timeout(limit, establish)
      .await
      .unwrap_or_else(|_| Err(timed_out(limit))),
  }
}

#[cfg(test)]
mod tests {
  use std::net::SocketAddr;
  use std::sync::Arc;
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use tokio::sync::watch;
  use tokio_util::sync::CancellationToken;

  use super::{EndpointSide, Tunnel, TunnelError, TunnelOptions, TunnelState};
  use crate::common::pipeline::spec::{EndpointRole, EndpointSpec};
  use crate::common::pipeline::tests::tag_registry;
  use crate::common::pipeline::{CompileError, Pipeline};

  async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      loop {
        let (mut stream, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
          let (mut read, mut write) = stream.split();
          let _ = tokio::io::copy(&mut read, &mut write).await;
        });
      }
    });
    addr
  }

  async fn wait_until_listening(state: &mut watch::Receiver<TunnelState>) -> SocketAddr {
    loop {
      if let TunnelState::Running {
        listening: Some(addr),
      } = *state.borrow_and_update()
      {
        return addr;
      }
      state.changed().await.unwrap();
    }
  }

  fn tunnel(source: &str, destination: &str, options: TunnelOptions) -> Arc<Tunnel> {
    Arc::new(Tunnel::new(
      Arc::new(tag_registry()),
      EndpointSpec::parse(source, EndpointRole::Listen).unwrap(),
      EndpointSpec::parse(destination, EndpointRole::Dial).unwrap(),
      options,
    ))
  }

  fn client_dialer() -> crate::common::pipeline::dialer::ComposedDialer {
    let spec = EndpointSpec::parse("alpha://127.0.0.1:1", EndpointRole::Dial).unwrap();
    Pipeline::compile_endpoint(&tag_registry(), &spec)
      .unwrap()
      .dialer()
      .unwrap()
  }

  #[tokio::test]
  async fn draining_force_closes_sessions_after_the_grace_period() {
    let echo = echo_server().await;
    let tunnel = tunnel(
      "alpha://127.0.0.1:0",
      &format!("tcp://{}", echo),
      TunnelOptions {
        grace_period: Duration::from_millis(200),
        ..Default::default()
      },
    );
    let mut state = tunnel.state();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
      let tunnel = tunnel.clone();
      let shutdown = shutdown.clone();
      async move { tunnel.run(shutdown).await }
    });
    let addr = wait_until_listening(&mut state).await;

    let authority = crate::common::pipeline::spec::Authority::new("127.0.0.1", addr.port());
    let mut conn = client_dialer().dial(&authority).await.unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    conn.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"ping");

    shutdown.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(5), running)
      .await
      .expect("tunnel must stop after the grace period")
      .unwrap()
      .unwrap();
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.forced_closed, 1);
    assert_eq!(*state.borrow(), TunnelState::Stopped);

    let mut rest = Vec::new();
    let _ = conn.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
    // No longer accepting
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
  }

  #[tokio::test]
  async fn sessions_finishing_within_the_grace_period_are_not_forced() {
    let echo = echo_server().await;
    let tunnel = tunnel(
      "alpha://127.0.0.1:0",
      &format!("tcp://{}", echo),
      TunnelOptions {
        grace_period: Duration::from_secs(30),
        ..Default::default()
      },
    );
    let mut state = tunnel.state();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
      let tunnel = tunnel.clone();
      let shutdown = shutdown.clone();
      async move { tunnel.run(shutdown).await }
    });
    let addr = wait_until_listening(&mut state).await;
    let authority = crate::common::pipeline::spec::Authority::new("127.0.0.1", addr.port());
    let mut conn = client_dialer().dial(&authority).await.unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    conn.read_exact(&mut pong).await.unwrap();

    shutdown.cancel();
    state
      .changed()
      .await
      .expect("state must advance after cancellation");
    assert_eq!(*state.borrow(), TunnelState::Draining);
    drop(conn);

    let summary = tokio::time::timeout(Duration::from_secs(5), running)
      .await
      .expect("a finished session must end draining early")
      .unwrap()
      .unwrap();
    assert_eq!(summary.forced_closed, 0);
  }

  #[tokio::test]
  async fn failed_destination_dials_do_not_stop_the_listener() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let refused = unused.local_addr().unwrap();
    drop(unused);
    let tunnel = tunnel(
      "alpha://127.0.0.1:0",
      &format!("tcp://{}", refused),
      TunnelOptions::default(),
    );
    let mut state = tunnel.state();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
      let tunnel = tunnel.clone();
      let shutdown = shutdown.clone();
      async move { tunnel.run(shutdown).await }
    });
    let addr = wait_until_listening(&mut state).await;
    let authority = crate::common::pipeline::spec::Authority::new("127.0.0.1", addr.port());

    for _ in 0..2 {
      let mut conn = client_dialer().dial(&authority).await.unwrap();
      let mut rest = Vec::new();
      let _ = tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut rest))
        .await
        .expect("abandoned sessions must close the accepted connection");
      assert!(rest.is_empty());
    }
    assert!(matches!(*state.borrow(), TunnelState::Running { .. }));

    shutdown.cancel();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.sessions, 2);
  }

  #[tokio::test]
  async fn compile_failures_stop_before_binding() {
    let tunnel = tunnel(
      "gamma://127.0.0.1:0",
      "tcp://127.0.0.1:1",
      TunnelOptions::default(),
    );
    let state = tunnel.state();
    match tunnel.run(CancellationToken::new()).await {
      Err(TunnelError::Compile {
        side: EndpointSide::Source,
        source: CompileError::UnknownDriver { .. },
      }) => {}
      other => panic!("Expected a compile failure, got {:?}", other),
    }
    assert_eq!(*state.borrow(), TunnelState::Stopped);
  }

  #[tokio::test]
  async fn dialing_sources_relay_a_single_session() {
    let echo = echo_server().await;
    // The "source" here is a plain listener standing in for a remote service
    let source = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let source_addr = source.local_addr().unwrap();
    let tunnel = Arc::new(Tunnel::new(
      Arc::new(tag_registry()),
      EndpointSpec::parse(&format!("tcp://{}", source_addr), EndpointRole::Dial).unwrap(),
      EndpointSpec::parse(&format!("tcp://{}", echo), EndpointRole::Dial).unwrap(),
      TunnelOptions::default(),
    ));
    let running = tokio::spawn({
      let tunnel = tunnel.clone();
      async move { tunnel.run(CancellationToken::new()).await }
    });
    let (mut stream, _) = source.accept().await.unwrap();
    stream.write_all(b"round trip").await.unwrap();
    let mut echoed = [0u8; 10];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"round trip");
    drop(stream);

    let summary = tokio::time::timeout(Duration::from_secs(5), running)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.forced_closed, 0);
  }

  #[tokio::test]
  async fn dialing_sources_honour_the_handshake_timeout() {
    let echo = echo_server().await;
    // Accepts but never answers the tag handshake
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let tunnel = Tunnel::new(
      Arc::new(tag_registry()),
      EndpointSpec::parse(&format!("alpha://{}", silent_addr), EndpointRole::Dial).unwrap(),
      EndpointSpec::parse(&format!("tcp://{}", echo), EndpointRole::Dial).unwrap(),
      TunnelOptions {
        handshake_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
      },
    );
    let state = tunnel.state();
    // The accepted stream stays open until both futures finish
    let (outcome, _accepted) = tokio::join!(
      tokio::time::timeout(Duration::from_secs(5), tunnel.run(CancellationToken::new())),
      silent.accept(),
    );
    let outcome = outcome.expect("the handshake timeout must end the tunnel");
    assert!(matches!(
      outcome,
      Err(TunnelError::TimedOut(limit)) if limit == Duration::from_millis(200)
    ));
    assert_eq!(*state.borrow(), TunnelState::Stopped);
  }

  #[tokio::test]
  async fn dialing_sources_stop_cleanly_when_cancelled_before_establishment() {
    let echo = echo_server().await;
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let tunnel = Arc::new(Tunnel::new(
      Arc::new(tag_registry()),
      EndpointSpec::parse(&format!("alpha://{}", silent_addr), EndpointRole::Dial).unwrap(),
      EndpointSpec::parse(&format!("tcp://{}", echo), EndpointRole::Dial).unwrap(),
      TunnelOptions {
        handshake_timeout: None,
        ..Default::default()
      },
    ));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
      let tunnel = tunnel.clone();
      let shutdown = shutdown.clone();
      async move { tunnel.run(shutdown).await }
    });
    // The tunnel is mid-handshake once its connection has been accepted
    let (_stream, _) = silent.accept().await.unwrap();
    shutdown.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(5), running)
      .await
      .expect("cancellation must end a pending establishment")
      .unwrap()
      .unwrap();
    assert_eq!(summary.sessions, 0);
    assert_eq!(*tunnel.state().borrow(), TunnelState::Stopped);
  }
}
