// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Endpoint specifications of the form `tls+ssh://host:port?tls.servername=x&ssh.user=y`
//!
//! The scheme lists layers outermost first, optionally prefixed by `tcp+`; a bare `tcp`
//! scheme has no layers. Query keys are scoped to a layer as `name.key` or `index.key`,
//! and may be left unscoped only when the stack has exactly one layer.

use std::fmt::Display;

use percent_encoding::percent_decode_str;
use url::{Host, Url};

use crate::common::driver::registry::is_valid_driver_name;
use crate::common::driver::{Params, Role};

const BASE_TRANSPORT: &str = "tcp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
  Listen,
  Dial,
}

impl EndpointRole {
  pub fn driver_role(self) -> Role {
    match self {
      EndpointRole::Listen => Role::Listener,
      EndpointRole::Dial => Role::Dialer,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
  pub host: String,
  pub port: u16,
}

impl Authority {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }
}

impl Display for Authority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
  pub name: String,
  pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
  pub authority: Authority,
  pub role: EndpointRole,
  pub layers: Vec<LayerSpec>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
  #[error("Endpoint is not a valid URI: {0}")]
  Malformed(String),
  #[error("Endpoint must name a host")]
  MissingHost,
  #[error("Endpoint must name a port")]
  MissingPort,
  #[error("Endpoint must not carry {0}")]
  Unexpected(&'static str),
  #[error("`{0}` is not a valid layer name")]
  InvalidLayer(String),
  #[error("Parameter `{0}` is not scoped to any layer of this stack")]
  UnknownScope(String),
  #[error("Parameter `{0}` must be scoped as `layer.key` in a multi-layer stack")]
  AmbiguousParameter(String),
  #[error("Scope `{0}` names a layer occurring more than once; scope it by position instead")]
  AmbiguousScope(String),
  #[error("Parameter `{key}` is given more than once for layer {index}")]
  DuplicateParameter { index: usize, key: String },
  #[error("Parameter `{0}` has an empty key")]
  EmptyKey(String),
  #[error("`{0}` does not percent-decode to UTF-8")]
  InvalidEncoding(String),
}

impl EndpointSpec {
  pub fn parse(uri: &str, role: EndpointRole) -> Result<Self, SpecError> {
    let url = Url::parse(uri).map_err(|e| SpecError::Malformed(e.to_string()))?;
    if !url.username().is_empty() || url.password().is_some() {
      return Err(SpecError::Unexpected("user information"));
    }
    if !matches!(url.path(), "" | "/") {
      return Err(SpecError::Unexpected("a path"));
    }
    if url.fragment().is_some() {
      return Err(SpecError::Unexpected("a fragment"));
    }
    let host = match url.host() {
      None => return Err(SpecError::MissingHost),
      Some(Host::Domain("")) => return Err(SpecError::MissingHost),
      Some(Host::Domain(domain)) => domain.to_owned(),
      Some(Host::Ipv4(addr)) => addr.to_string(),
      Some(Host::Ipv6(addr)) => addr.to_string(),
    };
    let port = url.port().ok_or(SpecError::MissingPort)?;

    let names = parse_stack(url.scheme())?;
    let mut layers: Vec<LayerSpec> = names
      .into_iter()
      .map(|name| LayerSpec {
        name,
        params: Params::new(),
      })
      .collect();

    let pairs = url.query().unwrap_or_default().split('&');
    for pair in pairs.filter(|pair| !pair.is_empty()) {
      let (raw_key, value) = decode_pair(pair)?;
      let (index, key) = resolve_scope(&layers, &raw_key)?;
      let previous = layers[index].params.insert(key, value);
      if previous.is_some() {
        return Err(SpecError::DuplicateParameter {
          index,
          key: key.to_owned(),
        });
      }
    }

    Ok(Self {
      authority: Authority::new(host, port),
      role,
      layers,
    })
  }

  pub fn layer_names(&self) -> impl Iterator<Item = &str> {
    self.layers.iter().map(|layer| layer.name.as_str())
  }
}

impl Display for EndpointSpec {
  /// Renders the stack and address only; parameters may hold key material
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.layers.is_empty() {
      f.write_str(BASE_TRANSPORT)?;
    } else {
      let names: Vec<&str> = self.layer_names().collect();
      f.write_str(&names.join("+"))?;
    }
    write!(f, "://{}", self.authority)
  }
}

fn parse_stack(scheme: &str) -> Result<Vec<String>, SpecError> {
  if scheme == BASE_TRANSPORT {
    return Ok(Vec::new());
  }
  let stack = scheme
    .strip_prefix("tcp+")
    .unwrap_or(scheme);
  stack
    .split('+')
    .map(|name| {
      if is_valid_driver_name(name) {
        Ok(name.to_owned())
      } else {
        Err(SpecError::InvalidLayer(name.to_owned()))
      }
    })
    .collect()
}

/// Query values are percent-decoded only; `+` is a literal plus, not a space
fn decode_pair(pair: &str) -> Result<(String, String), SpecError> {
  let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
  let decode = |raw: &str| {
    percent_decode_str(raw)
      .decode_utf8()
      .map(|decoded| decoded.into_owned())
      .map_err(|_| SpecError::InvalidEncoding(raw.to_owned()))
  };
  Ok((decode(key)?, decode(value)?))
}

fn resolve_scope<'k>(layers: &[LayerSpec], raw_key: &'k str) -> Result<(usize, &'k str), SpecError> {
  let (index, key) = match raw_key.split_once('.') {
    None => match layers.len() {
      0 => return Err(SpecError::UnknownScope(raw_key.to_owned())),
      1 => (0, raw_key),
      _ => return Err(SpecError::AmbiguousParameter(raw_key.to_owned())),
    },
    Some((scope, key)) => {
      let index = match scope.parse::<usize>() {
        Ok(position) if position < layers.len() => position,
        Ok(_) => return Err(SpecError::UnknownScope(raw_key.to_owned())),
        Err(_) => {
          let mut matching = layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.name == scope)
            .map(|(index, _)| index);
          match (matching.next(), matching.next()) {
            (None, _) => return Err(SpecError::UnknownScope(raw_key.to_owned())),
            (Some(index), None) => index,
            (Some(_), Some(_)) => return Err(SpecError::AmbiguousScope(scope.to_owned())),
          }
        }
      };
      (index, key)
    }
  };
  if key.is_empty() {
    return Err(SpecError::EmptyKey(raw_key.to_owned()));
  }
  Ok((index, key))
}
