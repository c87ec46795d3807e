// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::util::stream::BoxedConnection;
use crate::util::{copy_until_closed, CopyEnd, CopyOutcome};

/// Bytes moved by a finished relay, per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
  pub accepted_to_dialed: u64,
  pub dialed_to_accepted: u64,
  /// Whether the session was ended by its owner rather than by either peer
  pub forced: bool,
}

/// A pair of fully upgraded connections relayed into one another
///
/// Half-close is not preserved: once either direction ends, both connections are closed.
pub struct RelaySession {
  accepted: BoxedConnection,
  dialed: BoxedConnection,
}

impl RelaySession {
  pub fn new(accepted: BoxedConnection, dialed: BoxedConnection) -> Self {
    Self { accepted, dialed }
  }

  /// Relays until either direction ends or `cancel` fires, then closes both connections
  pub async fn run(self, cancel: CancellationToken) -> RelayStats {
    let close = cancel.child_token();
    let (accepted_read, accepted_write) = tokio::io::split(self.accepted);
    let (dialed_read, dialed_write) = tokio::io::split(self.dialed);
    let forward = tokio::task::spawn(
      copy_until_closed(accepted_read, dialed_write, close.clone())
        .instrument(tracing::trace_span!("forward")),
    );
    let backward = tokio::task::spawn(
      copy_until_closed(dialed_read, accepted_write, close.clone())
        .instrument(tracing::trace_span!("backward")),
    );
    let (forward, backward) = tokio::join!(forward, backward);
    let (forward, backward) = (settle(forward), settle(backward));
    // Both halves of each connection have been dropped by their tasks by now

    for (direction, outcome) in [("forward", &forward), ("backward", &backward)] {
      if let CopyEnd::Failed(error) = &outcome.end {
        tracing::debug!(direction, ?error, "relay direction failed");
      }
    }
    let stats = RelayStats {
      accepted_to_dialed: forward.bytes,
      dialed_to_accepted: backward.bytes,
      forced: cancel.is_cancelled(),
    };
    tracing::info!(
      accepted_to_dialed = stats.accepted_to_dialed,
      dialed_to_accepted = stats.dialed_to_accepted,
      forced = stats.forced,
      "session closed"
    );
    stats
  }
}

fn settle(joined: Result<CopyOutcome, JoinError>) -> CopyOutcome {
  joined.unwrap_or_else(|error| CopyOutcome {
    bytes: 0,
    end: CopyEnd::Failed(std::io::Error::new(std::io::ErrorKind::Other, error)),
  })
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
  use tokio_util::sync::CancellationToken;

  use super::RelaySession;

  #[tokio::test]
  async fn end_of_stream_on_one_side_closes_both() {
    let (mut client, accepted) = duplex(1024);
    let (dialed, mut server) = duplex(1024);
    let session = tokio::spawn(
      RelaySession::new(Box::new(accepted), Box::new(dialed)).run(CancellationToken::new()),
    );

    client.write_all(b"hello").await.unwrap();
    let mut hello = [0u8; 5];
    server.read_exact(&mut hello).await.unwrap();
    assert_eq!(&hello, b"hello");
    server.write_all(b"world!").await.unwrap();
    let mut world = [0u8; 6];
    client.read_exact(&mut world).await.unwrap();
    assert_eq!(&world, b"world!");

    // Half-close from the client; the server side never closes on its own
    client.shutdown().await.unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), session)
      .await
      .expect("session must end once one direction reaches end-of-stream")
      .unwrap();
    assert_eq!(stats.accepted_to_dialed, 5);
    assert_eq!(stats.dialed_to_accepted, 6);
    assert!(!stats.forced);

    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test]
  async fn cancellation_force_closes_an_active_session() {
    let (mut client, accepted) = duplex(1024);
    let (dialed, mut server) = duplex(1024);
    let cancel = CancellationToken::new();
    let session =
      tokio::spawn(RelaySession::new(Box::new(accepted), Box::new(dialed)).run(cancel.clone()));
    client.write_all(b"x").await.unwrap();
    let mut x = [0u8; 1];
    server.read_exact(&mut x).await.unwrap();

    cancel.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(5), session)
      .await
      .unwrap()
      .unwrap();
    assert!(stats.forced);
    assert_eq!(stats.accepted_to_dialed, 1);
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    assert_eq!(server.read(&mut buf).await.unwrap(), 0);
  }
}
