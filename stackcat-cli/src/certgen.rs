// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use stackcat::drivers::pin::SpkiPin;
use tracing::instrument;

/// Prints a fresh self-signed certificate and key as hex-encoded PEM, ready for `cert=` and `key=`
#[instrument]
pub fn certgen_main(sans: Vec<String>) -> Result<()> {
  let cert = rcgen::generate_simple_self_signed(sans).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem().context("Certificate serialization failed")?;
  let private_pem = cert.serialize_private_key_pem();
  let der = cert
    .serialize_der()
    .context("Certificate serialization failed")?;
  let pin = SpkiPin::of_certificate(&der).context("Generated certificate could not be read back")?;
  println!("cert={}", hex::encode(public_pem));
  println!("key={}", hex::encode(private_pem));
  println!("# spki-sha256={}", pin.to_hex());
  Ok(())
}
