// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use anyhow::{Error as AnyErr, Result};

use crate::common::pipeline::spec::{EndpointRole, EndpointSpec};

pub fn parse_endpoint(v: &str, role: EndpointRole) -> Result<EndpointSpec> {
  EndpointSpec::parse(v, role).map_err(Into::into)
}

/// Parses whole or fractional seconds, such as `5` or `0.25`
pub fn parse_duration_secs(v: &str) -> Result<Duration> {
  let seconds = v
    .trim()
    .parse::<f64>()
    .map_err(|_| AnyErr::msg("Duration must be a number of seconds"))?;
  if !seconds.is_finite() || seconds < 0.0 {
    return Err(AnyErr::msg("Duration must be a finite, non-negative number of seconds"));
  }
  Duration::try_from_secs_f64(seconds)
    .map_err(|_| AnyErr::msg("Duration is too large to represent"))
}

/// Endpoint URIs are checked for syntax only; drivers are resolved at compile time
pub fn validate_endpoint(v: &str) -> Result<(), String> {
  parse_endpoint(v, EndpointRole::Dial)
    .map(|_| ())
    .map_err(|e| e.to_string())
}

pub fn validate_duration_secs(v: &str) -> Result<(), String> {
  parse_duration_secs(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::{parse_duration_secs, validate_duration_secs, validate_endpoint};

  #[test]
  fn durations() {
    assert_eq!(parse_duration_secs("5").unwrap(), Duration::from_secs(5));
    assert_eq!(parse_duration_secs("0.25").unwrap(), Duration::from_millis(250));
    assert!(parse_duration_secs("-1").is_err());
    assert!(parse_duration_secs("soon").is_err());
    assert!(parse_duration_secs("inf").is_err());
  }

  #[test]
  fn out_of_range_durations_are_errors() {
    for input in ["1e20", "inf", "-inf", "NaN", "-0.5"] {
      assert!(parse_duration_secs(input).is_err(), "{} must be rejected", input);
      assert!(validate_duration_secs(input).is_err());
    }
  }

  #[test]
  fn endpoints() {
    assert!(validate_endpoint("tls+ssh://example.com:22?tls.servername=example.com").is_ok());
    assert!(validate_endpoint("tcp://127.0.0.1:80").is_ok());
    assert!(validate_endpoint("example.com:80").is_err());
  }
}
