// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Public-key pinning for TLS dialers
//!
//! A pin is the SHA-256 digest of a certificate's DER-encoded SubjectPublicKeyInfo.
//! Pinned dialers accept exactly the peers presenting that key, in place of chain validation.

use std::time::SystemTime;

use ring::digest;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, CertificateError, ServerName};

pub const PIN_LEN: usize = 32;

#[derive(thiserror::Error, Debug)]
#[error("Certificate could not be parsed: {0}")]
pub struct MalformedCertificate(String);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SpkiPin([u8; PIN_LEN]);

impl SpkiPin {
  /// Pins the public key of a DER-encoded X.509 certificate
  pub fn of_certificate(der: &[u8]) -> Result<Self, MalformedCertificate> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
      .map_err(|error| MalformedCertificate(error.to_string()))?;
    let spki = cert.tbs_certificate.subject_pki.raw;
    let mut pin = [0u8; PIN_LEN];
    pin.copy_from_slice(digest::digest(&digest::SHA256, spki).as_ref());
    Ok(Self(pin))
  }

  pub fn as_bytes(&self) -> &[u8; PIN_LEN] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl std::fmt::Debug for SpkiPin {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "SpkiPin({})", self.to_hex())
  }
}

/// Accepts a server only if its end-entity certificate carries the pinned key
///
/// Handshake signatures are still checked against that key by rustls; names and chains are not.
#[derive(Debug)]
pub struct SpkiPinVerifier {
  pin: SpkiPin,
}

impl SpkiPinVerifier {
  pub fn new(pin: SpkiPin) -> Self {
    Self { pin }
  }
}

impl ServerCertVerifier for SpkiPinVerifier {
  fn verify_server_cert(
    &self,
    end_entity: &Certificate,
    _intermediates: &[Certificate],
    _server_name: &ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: SystemTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    let presented = SpkiPin::of_certificate(&end_entity.0)
      .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
    if presented == self.pin {
      tracing::trace!(pin = %presented.to_hex(), "peer matched pinned key");
      Ok(ServerCertVerified::assertion())
    } else {
      tracing::debug!(
        expected = %self.pin.to_hex(),
        presented = %presented.to_hex(),
        "peer key does not match pin"
      );
      Err(rustls::Error::InvalidCertificate(
        CertificateError::ApplicationVerificationFailure,
      ))
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::SystemTime;

  use rustls::client::ServerCertVerifier;
  use rustls::{Certificate, ServerName};

  use super::{SpkiPin, SpkiPinVerifier};

  fn der(cert: &rcgen::Certificate) -> Vec<u8> {
    cert.serialize_der().unwrap()
  }

  #[test]
  fn pins_depend_on_the_key_only() {
    let key = rcgen::KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let key_der = key.serialize_der();
    let mut first = rcgen::CertificateParams::new(vec!["one.test".to_string()]);
    first.key_pair = Some(key);
    let mut second = rcgen::CertificateParams::new(vec!["two.test".to_string()]);
    second.key_pair = Some(rcgen::KeyPair::from_der(&key_der).unwrap());
    let first = rcgen::Certificate::from_params(first).unwrap();
    let second = rcgen::Certificate::from_params(second).unwrap();
    let other = rcgen::generate_simple_self_signed(vec!["one.test".to_string()]).unwrap();

    let pin = SpkiPin::of_certificate(&der(&first)).unwrap();
    assert_eq!(pin, SpkiPin::of_certificate(&der(&second)).unwrap());
    assert_ne!(pin, SpkiPin::of_certificate(&der(&other)).unwrap());
    assert_eq!(pin.to_hex().len(), 64);
  }

  #[test]
  fn verifier_rejects_other_keys() {
    let pinned = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
    let other = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
    let verifier = SpkiPinVerifier::new(SpkiPin::of_certificate(&der(&pinned)).unwrap());
    let name = ServerName::try_from("a.test").unwrap();
    let verify = |cert: &rcgen::Certificate| {
      verifier.verify_server_cert(
        &Certificate(der(cert)),
        &[],
        &name,
        &mut std::iter::empty(),
        &[],
        SystemTime::now(),
      )
    };
    assert!(verify(&pinned).is_ok());
    assert!(matches!(
      verify(&other),
      Err(rustls::Error::InvalidCertificate(_))
    ));
  }

  #[test]
  fn malformed_certificates_are_rejected() {
    assert!(SpkiPin::of_certificate(b"not a certificate").is_err());
  }
}
