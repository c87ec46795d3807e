// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! TLS dialer whose ClientHello follows the shape of a common browser
//!
//! rustls does not expose the full ClientHello, so a profile fixes what it can:
//! cipher suite order, key exchange groups, and ALPN offers.

use std::str::FromStr;

use rustls::cipher_suite::*;
use rustls::kx_group::{SECP256R1, SECP384R1, X25519};
use rustls::{ClientConfig, SupportedCipherSuite, SupportedKxGroup};

use super::tls::{server_name, ServerTrust, TlsConnect};
use crate::common::driver::{Driver, DriverError, Params, Role, Upgrades};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloProfile {
  Chrome,
  Firefox,
  Safari,
  Edge,
}

impl HelloProfile {
  pub const ALL: [HelloProfile; 4] = [Self::Chrome, Self::Firefox, Self::Safari, Self::Edge];

  fn cipher_suites(self) -> Vec<SupportedCipherSuite> {
    match self {
      Self::Chrome | Self::Edge => vec![
        TLS13_AES_128_GCM_SHA256,
        TLS13_AES_256_GCM_SHA384,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
      ],
      Self::Firefox => vec![
        TLS13_AES_128_GCM_SHA256,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS13_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
      ],
      Self::Safari => vec![
        TLS13_AES_128_GCM_SHA256,
        TLS13_AES_256_GCM_SHA384,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
      ],
    }
  }

  /// All current profiles offer the same groups in the same order
  fn kx_groups(self) -> Vec<&'static SupportedKxGroup> {
    vec![&X25519, &SECP256R1, &SECP384R1]
  }

  fn alpn(self) -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
  }

  fn client_config(self, trust: &ServerTrust) -> Result<ClientConfig, DriverError> {
    let builder = ClientConfig::builder()
      .with_cipher_suites(&self.cipher_suites())
      .with_kx_groups(&self.kx_groups())
      .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
      .map_err(|e| DriverError::invalid("hello", e))?;
    let mut config = trust.client_config(builder);
    config.alpn_protocols = self.alpn();
    Ok(config)
  }
}

/// A fixed profile, or a fresh choice among all profiles for every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloChoice {
  Fixed(HelloProfile),
  Randomized,
}

impl Default for HelloChoice {
  fn default() -> Self {
    Self::Fixed(HelloProfile::Chrome)
  }
}

impl FromStr for HelloChoice {
  type Err = DriverError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "chrome" => Ok(Self::Fixed(HelloProfile::Chrome)),
      "firefox" => Ok(Self::Fixed(HelloProfile::Firefox)),
      "safari" => Ok(Self::Fixed(HelloProfile::Safari)),
      "edge" => Ok(Self::Fixed(HelloProfile::Edge)),
      "randomized" => Ok(Self::Randomized),
      other => Err(DriverError::invalid(
        "hello",
        format!(
          "unknown profile `{}`; expected chrome, firefox, safari, edge or randomized",
          other
        ),
      )),
    }
  }
}

impl HelloChoice {
  fn profiles(self) -> Vec<HelloProfile> {
    match self {
      Self::Fixed(profile) => vec![profile],
      Self::Randomized => HelloProfile::ALL.to_vec(),
    }
  }
}

pub struct UtlsDriver;

impl Driver for UtlsDriver {
  fn build(&self, params: &Params, role: Role) -> Result<Upgrades, DriverError> {
    if role == Role::Listener {
      return Err(DriverError::RoleIncompatible { role });
    }
    let mut reader = params.reader();
    reader.reject("key", role)?;
    let server_name = reader
      .optional("servername")
      .map(|name| server_name("servername", name))
      .transpose()?;
    let trust = ServerTrust::from_params(&mut reader, server_name.as_ref())?;
    let hello = reader
      .optional("hello")
      .map(HelloChoice::from_str)
      .transpose()?
      .unwrap_or_default();
    // ALPN belongs to the profile
    reader.reject("alpn", role)?;
    reader.finish()?;

    let configs = hello
      .profiles()
      .into_iter()
      .map(|profile| profile.client_config(&trust))
      .collect::<Result<Vec<_>, _>>()?;
    tracing::trace!(?hello, "utls profiles prepared");
    Ok(TlsConnect::new(configs, server_name).into_upgrades())
  }
}
