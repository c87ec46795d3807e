// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::collections::BTreeMap;
use std::sync::Arc;

use super::Driver;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
  #[error("A driver named `{0}` is already registered")]
  DuplicateDriver(String),
  #[error("No driver named `{0}` is registered")]
  UnknownDriver(String),
  #[error("`{0}` is not a valid driver name; names are lowercase ASCII letters and digits")]
  InvalidName(String),
}

/// Name-keyed set of drivers available to pipeline compilation
///
/// Registration happens during startup; once a registry is shared (usually via [Arc])
/// it is only read, so lookups need no synchronization.
#[derive(Default, Clone)]
pub struct DriverRegistry {
  drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry holding every driver shipped with this crate
  pub fn with_builtin_drivers() -> Result<Self, RegistryError> {
    let mut registry = Self::new();
    crate::drivers::register_builtin(&mut registry)?;
    Ok(registry)
  }

  pub fn register<D: Driver + 'static>(
    &mut self,
    name: impl Into<String>,
    driver: D,
  ) -> Result<(), RegistryError> {
    self.register_arc(name, Arc::new(driver))
  }

  pub fn register_arc(
    &mut self,
    name: impl Into<String>,
    driver: Arc<dyn Driver>,
  ) -> Result<(), RegistryError> {
    let name = name.into();
    if !is_valid_driver_name(&name) {
      return Err(RegistryError::InvalidName(name));
    }
    if self.drivers.contains_key(&name) {
      return Err(RegistryError::DuplicateDriver(name));
    }
    tracing::trace!(name = name.as_str(), "driver registered");
    self.drivers.insert(name, driver);
    Ok(())
  }

  pub fn lookup(&self, name: &str) -> Result<Arc<dyn Driver>, RegistryError> {
    self
      .drivers
      .get(name)
      .cloned()
      .ok_or_else(|| RegistryError::UnknownDriver(name.to_owned()))
  }

  /// Registered names in lexical order
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.drivers.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.drivers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.drivers.is_empty()
  }
}

impl std::fmt::Debug for DriverRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DriverRegistry")
      .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
      .finish()
  }
}

/// Names appear in URI schemes joined by `+`, so they are restricted to what a scheme
/// may carry without ambiguity; `tcp` names the base transport and cannot be a layer.
pub fn is_valid_driver_name(name: &str) -> bool {
  !name.is_empty()
    && name != "tcp"
    && name
      .bytes()
      .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    && name.as_bytes()[0].is_ascii_lowercase()
}
