// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Names reserved for protocols this build cannot speak
//!
//! Pipelines naming them fail to compile with [DriverError::Unsupported] rather than
//! as unknown drivers.

use crate::common::driver::{Driver, DriverError, Params, Role, Upgrades};

pub const DATAGRAM_ONLY: &str =
  "DTLS runs over datagrams, and every stackcat layer wraps a byte stream";
pub const STANDARD_TLS_PSK: &str =
  "rustls has no external pre-shared key support; use `psk` for a pre-shared key channel";

pub struct UnsupportedDriver {
  reason: &'static str,
}

impl UnsupportedDriver {
  pub const fn new(reason: &'static str) -> Self {
    Self { reason }
  }
}

impl Driver for UnsupportedDriver {
  fn build(&self, _params: &Params, _role: Role) -> Result<Upgrades, DriverError> {
    Err(DriverError::Unsupported {
      reason: self.reason.to_owned(),
    })
  }
}
