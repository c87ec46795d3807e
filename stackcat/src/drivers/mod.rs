// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Built-in layer drivers

use crate::common::driver::registry::{DriverRegistry, RegistryError};
use unsupported::UnsupportedDriver;

pub mod aesgcm;
pub mod dnst;
pub mod pin;
pub mod psk;
pub mod ssh;
pub mod tls;
pub mod unsupported;
pub mod utls;

pub fn register_builtin(registry: &mut DriverRegistry) -> Result<(), RegistryError> {
  registry.register("aesgcm", aesgcm::AesGcmDriver)?;
  registry.register("dnst", dnst::DnsTunnelDriver)?;
  registry.register("dtls", UnsupportedDriver::new(unsupported::DATAGRAM_ONLY))?;
  registry.register("dtlspsk", UnsupportedDriver::new(unsupported::DATAGRAM_ONLY))?;
  registry.register("psk", psk::PskDriver)?;
  registry.register("ssh", ssh::SshDriver)?;
  registry.register("tls", tls::TlsDriver)?;
  registry.register("tlspsk", UnsupportedDriver::new(unsupported::STANDARD_TLS_PSK))?;
  registry.register("utls", utls::UtlsDriver)?;
  Ok(())
}
