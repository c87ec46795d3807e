// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
  pub fn new(inner: u64) -> SessionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for SessionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<SessionId> for u64 {
  fn from(id: SessionId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("SessionId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Hands out session identifiers unique within one tunnel
#[derive(Debug)]
pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> SessionId {
    SessionId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for MonotonicAtomicGenerator {
  fn default() -> Self {
    Self::new(1)
  }
}

#[cfg(test)]
mod tests {
  use super::MonotonicAtomicGenerator;

  #[test]
  fn identifiers_are_sequential() {
    let ids = MonotonicAtomicGenerator::default();
    assert_eq!(ids.next().inner(), 1);
    assert_eq!(ids.next().inner(), 2);
    assert_eq!(u64::from(ids.next()), 3);
  }
}
