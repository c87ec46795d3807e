// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! TLS over rustls
//!
//! Listeners require `cert` and `key`. Dialers verify the server by `servername` against
//! `ca` (or the platform trust store when no `ca` is given), or by an SPKI pin taken
//! from `cert`. Both roles accept a comma-separated `alpn` list.

use std::io::{self, BufReader};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use rustls::{
  Certificate, ClientConfig, ConfigBuilder, PrivateKey, RootCertStore, ServerConfig, ServerName,
  WantsVerifier,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::Instrument;

use super::pin::{SpkiPin, SpkiPinVerifier};
use crate::common::driver::{
  ConnUpgrade, DialerCapabilities, DialerUpgrade, Driver, DriverError, HandshakeError, LayerId,
  ListenerCapabilities, ListenerUpgrade, ParamReader, Params, Role, UpgradeError, Upgrades,
};
use crate::common::pipeline::dialer::{ArcDialer, DialError, Dialer};
use crate::common::pipeline::listener::{BoxedListener, Incoming, Listener};
use crate::common::pipeline::spec::Authority;
use crate::util::sealed::random_bytes;
use crate::util::stream::{self, BoxedConnection};

pub struct TlsDriver;

impl Driver for TlsDriver {
  fn build(&self, params: &Params, role: Role) -> Result<Upgrades, DriverError> {
    let mut reader = params.reader();
    let upgrades = match role {
      Role::Listener => {
        let listen = Arc::new(TlsListen::from_params(&mut reader)?);
        Upgrades::Listener(ListenerCapabilities::Both {
          listen: listen.clone(),
          conn: listen,
        })
      }
      Role::Dialer => TlsConnect::from_params(&mut reader)?.into_upgrades(),
    };
    reader.finish()?;
    Ok(upgrades)
  }
}

pub(crate) fn certificates_from_pem(param: &str, pem: &[u8]) -> Result<Vec<Certificate>, DriverError> {
  let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
    .map_err(|e| DriverError::invalid(param, e))?;
  if certs.is_empty() {
    return Err(DriverError::invalid(param, "no PEM certificate found"));
  }
  Ok(certs.into_iter().map(Certificate).collect())
}

pub(crate) fn private_key_from_pem(param: &str, pem: &[u8]) -> Result<PrivateKey, DriverError> {
  let items = rustls_pemfile::read_all(&mut BufReader::new(pem))
    .map_err(|e| DriverError::invalid(param, e))?;
  items
    .into_iter()
    .find_map(|item| match item {
      rustls_pemfile::Item::PKCS8Key(key)
      | rustls_pemfile::Item::RSAKey(key)
      | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
      _ => None,
    })
    .ok_or_else(|| DriverError::invalid(param, "no PEM private key found"))
}

/// Trust anchors from `ca` if given, otherwise from the platform store
pub(crate) fn root_store(ca: Option<&[u8]>) -> Result<RootCertStore, DriverError> {
  let mut roots = RootCertStore::empty();
  let anchors: Vec<Vec<u8>> = match ca {
    Some(pem) => certificates_from_pem("ca", pem)?
      .into_iter()
      .map(|c| c.0)
      .collect(),
    None => rustls_native_certs::load_native_certs()
      .map_err(|e| DriverError::invalid("ca", format!("platform trust store unavailable: {}", e)))?
      .into_iter()
      .map(|c| c.0)
      .collect(),
  };
  let (added, ignored) = roots.add_parsable_certificates(&anchors[..]);
  if ignored > 0 {
    tracing::debug!(added, ignored, "some trust anchors could not be parsed");
  }
  if added == 0 && ca.is_some() {
    return Err(DriverError::invalid("ca", "no usable trust anchor"));
  }
  Ok(roots)
}

pub(crate) fn pin_from_pem(param: &str, pem: &[u8]) -> Result<SpkiPin, DriverError> {
  let certs = certificates_from_pem(param, pem)?;
  SpkiPin::of_certificate(&certs[0].0).map_err(|e| DriverError::invalid(param, e))
}

pub(crate) fn server_name(param: &str, value: &str) -> Result<ServerName, DriverError> {
  ServerName::try_from(value).map_err(|e| DriverError::invalid(param, e))
}

/// Comma-separated protocol names
pub(crate) fn alpn_protocols(value: Option<&str>) -> Result<Vec<Vec<u8>>, DriverError> {
  match value {
    None => Ok(Vec::new()),
    Some(list) => list
      .split(',')
      .map(|protocol| match protocol.trim() {
        "" => Err(DriverError::invalid("alpn", "empty protocol name")),
        name if name.len() > 255 => Err(DriverError::invalid("alpn", "protocol name too long")),
        name => Ok(name.as_bytes().to_vec()),
      })
      .collect(),
  }
}

/// Classifies a failed TLS handshake, separating peer verification failures from the rest
pub(crate) fn handshake_error(error: io::Error) -> HandshakeError {
  let classified = match error
    .get_ref()
    .and_then(|inner| inner.downcast_ref::<rustls::Error>())
  {
    Some(rustls::Error::InvalidCertificate(reason)) => {
      Some(HandshakeError::Verification(format!("{:?}", reason)))
    }
    Some(rustls::Error::AlertReceived(alert)) => {
      Some(HandshakeError::Protocol(format!("peer sent alert {:?}", alert)))
    }
    Some(other) => Some(HandshakeError::Protocol(other.to_string())),
    None => None,
  };
  classified.unwrap_or_else(|| HandshakeError::Io(error))
}

/// Name sent when a conn-only dialer has no `servername`; rustls omits SNI for addresses
fn unnamed_server() -> ServerName {
  ServerName::IpAddress(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub(crate) struct TlsListen {
  acceptor: TlsAcceptor,
}

impl TlsListen {
  fn from_params(reader: &mut ParamReader<'_>) -> Result<Self, DriverError> {
    reader.reject("servername", Role::Listener)?;
    reader.reject("ca", Role::Listener)?;
    let cert_pem = reader.required_hex("cert")?;
    let key_pem = reader.required_hex("key")?;
    let alpn = alpn_protocols(reader.optional("alpn"))?;
    let certs = certificates_from_pem("cert", &cert_pem)?;
    let key = private_key_from_pem("key", &key_pem)?;
    let mut config = ServerConfig::builder()
      .with_safe_defaults()
      .with_no_client_auth()
      .with_single_cert(certs, key)
      .map_err(|e| DriverError::invalid("key", e))?;
    config.alpn_protocols = alpn;
    Ok(Self {
      acceptor: TlsAcceptor::from(Arc::new(config)),
    })
  }
}

impl ConnUpgrade for TlsListen {
  fn upgrade(
    &self,
    conn: BoxedConnection,
    _role: Role,
  ) -> BoxFuture<'static, Result<BoxedConnection, HandshakeError>> {
    let accepting = self.acceptor.accept(conn);
    async move {
      let stream = accepting.await.map_err(handshake_error)?;
      {
        let (_, session) = stream.get_ref();
        tracing::trace!(
          sni = ?session.server_name(),
          alpn = ?session.alpn_protocol().map(String::from_utf8_lossy),
          "tls accepted"
        );
      }
      Ok(stream::boxed(stream))
    }
    .boxed()
  }
}

impl ListenerUpgrade for TlsListen {
  fn upgrade_listener(&self, inner: BoxedListener, layer: LayerId) -> BoxedListener {
    Box::new(TlsListener {
      inner,
      acceptor: self.acceptor.clone(),
      layer,
    })
  }
}

struct TlsListener {
  inner: BoxedListener,
  acceptor: TlsAcceptor,
  layer: LayerId,
}

impl Listener for TlsListener {
  fn accept(&mut self) -> BoxFuture<'_, io::Result<Incoming>> {
    async move {
      let incoming = self.inner.accept().await?;
      let acceptor = self.acceptor.clone();
      let layer = self.layer.clone();
      let span = tracing::debug_span!("tls_accept", layer = %layer, peer = %incoming.peer());
      Ok(incoming.then_upgrade(move |conn| {
        async move {
          let stream = acceptor
            .accept(conn)
            .await
            .map_err(|e| UpgradeError::new(layer, handshake_error(e)))?;
          tracing::trace!(sni = ?stream.get_ref().1.server_name(), "tls accepted");
          Ok(stream::boxed(stream))
        }
        .instrument(span)
      }))
    }
    .boxed()
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    self.inner.local_addr()
  }
}

/// How a dialer decides whether to trust the server it reached
#[derive(Clone)]
pub(crate) enum ServerTrust {
  Pinned(SpkiPin),
  Anchored(RootCertStore),
}

impl ServerTrust {
  /// Reads `cert` as a pin, else `ca` as anchors; one of `cert` and `servername` is required
  pub(crate) fn from_params(
    reader: &mut ParamReader<'_>,
    server_name: Option<&ServerName>,
  ) -> Result<Self, DriverError> {
    let pin = reader
      .optional_hex("cert")?
      .map(|pem| pin_from_pem("cert", &pem))
      .transpose()?;
    let ca = reader.optional_hex("ca")?;
    match (pin, server_name) {
      (Some(_), _) if ca.is_some() => Err(DriverError::invalid(
        "ca",
        "has no effect on a pinned dialer",
      )),
      (Some(pin), _) => Ok(Self::Pinned(pin)),
      (None, Some(_)) => Ok(Self::Anchored(root_store(ca.as_deref())?)),
      (None, None) => Err(DriverError::MissingParameter {
        param: "servername".into(),
      }),
    }
  }

  pub(crate) fn client_config(
    &self,
    builder: ConfigBuilder<ClientConfig, WantsVerifier>,
  ) -> ClientConfig {
    match self {
      Self::Pinned(pin) => builder
        .with_custom_certificate_verifier(Arc::new(SpkiPinVerifier::new(*pin)))
        .with_no_client_auth(),
      Self::Anchored(roots) => builder
        .with_root_certificates(roots.clone())
        .with_no_client_auth(),
    }
  }
}

/// Client side of a TLS layer; with several connectors, each connection uses one chosen at random
pub(crate) struct TlsConnect {
  connectors: Arc<[TlsConnector]>,
  server_name: Option<ServerName>,
}

impl TlsConnect {
  pub(crate) fn new(configs: Vec<ClientConfig>, server_name: Option<ServerName>) -> Self {
    debug_assert!(!configs.is_empty());
    Self {
      connectors: configs
        .into_iter()
        .map(|config| TlsConnector::from(Arc::new(config)))
        .collect(),
      server_name,
    }
  }

  fn from_params(reader: &mut ParamReader<'_>) -> Result<Self, DriverError> {
    reader.reject("key", Role::Dialer)?;
    let server_name = reader
      .optional("servername")
      .map(|name| server_name("servername", name))
      .transpose()?;
    let trust = ServerTrust::from_params(reader, server_name.as_ref())?;
    let alpn = alpn_protocols(reader.optional("alpn"))?;
    let mut config = trust.client_config(ClientConfig::builder().with_safe_defaults());
    config.alpn_protocols = alpn;
    Ok(Self::new(vec![config], server_name))
  }

  /// Dial and conn capabilities sharing this client
  pub(crate) fn into_upgrades(self) -> Upgrades {
    let connect = Arc::new(self);
    Upgrades::Dialer(DialerCapabilities::Both {
      dial: connect.clone(),
      conn: connect,
    })
  }
}

fn choose(connectors: &[TlsConnector]) -> Option<TlsConnector> {
  let index = match connectors.len() {
    0 | 1 => 0,
    n => random_bytes::<1>()
      .map(|[byte]| byte as usize % n)
      .unwrap_or(0),
  };
  connectors.get(index).cloned()
}

fn no_connector() -> HandshakeError {
  HandshakeError::Protocol("no client configuration available".into())
}

impl ConnUpgrade for TlsConnect {
  fn upgrade(
    &self,
    conn: BoxedConnection,
    _role: Role,
  ) -> BoxFuture<'static, Result<BoxedConnection, HandshakeError>> {
    let name = self.server_name.clone().unwrap_or_else(unnamed_server);
    let connector = choose(&self.connectors);
    async move {
      let connector = connector.ok_or_else(no_connector)?;
      let stream = connector
        .connect(name, conn)
        .await
        .map_err(handshake_error)?;
      Ok(stream::boxed(stream))
    }
    .boxed()
  }
}

impl DialerUpgrade for TlsConnect {
  fn upgrade_dialer(&self, inner: ArcDialer, layer: LayerId) -> ArcDialer {
    Arc::new(TlsDialer {
      inner,
      connectors: self.connectors.clone(),
      server_name: self.server_name.clone(),
      layer,
    })
  }
}

/// Dials `inner`, then names the server after the dialed host unless `servername` was given
struct TlsDialer {
  inner: ArcDialer,
  connectors: Arc<[TlsConnector]>,
  server_name: Option<ServerName>,
  layer: LayerId,
}

impl Dialer for TlsDialer {
  fn dial(&self, authority: &Authority) -> BoxFuture<'static, Result<BoxedConnection, DialError>> {
    let connecting = self.inner.dial(authority);
    let connector = choose(&self.connectors);
    let layer = self.layer.clone();
    let name = match &self.server_name {
      Some(name) => Ok(name.clone()),
      None => ServerName::try_from(authority.host.as_str())
        .map_err(|e| HandshakeError::Protocol(format!("host is not a valid server name: {}", e))),
    };
    let span = tracing::debug_span!("tls_connect", layer = %layer);
    async move {
      let conn = connecting.await?;
      let (name, connector) = name
        .and_then(|name| Ok((name, connector.ok_or_else(no_connector)?)))
        .map_err(|e| UpgradeError::new(layer.clone(), e))?;
      let stream = connector
        .connect(name, conn)
        .await
        .map_err(|e| UpgradeError::new(layer, handshake_error(e)))?;
      tracing::trace!(
        alpn = ?stream.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
        "tls connected"
      );
      Ok(stream::boxed(stream))
    }
    .instrument(span)
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::TlsDriver;
  use crate::common::driver::registry::DriverRegistry;
  use crate::common::driver::{Driver, DriverError, HandshakeError, Role};
  use crate::common::pipeline::dialer::DialError;
  use crate::common::pipeline::spec::{Authority, EndpointRole, EndpointSpec};
  use crate::common::pipeline::Pipeline;
  use crate::drivers::test_support::{
    assert_carries, handshake_pair, params, self_signed, TestCertificate,
  };

  fn listener_spec(cert: &TestCertificate) -> EndpointSpec {
    EndpointSpec::parse(
      &format!("tls://127.0.0.1:0?cert={}&key={}", cert.cert, cert.key),
      EndpointRole::Listen,
    )
    .unwrap()
  }

  /// Binds `listener`, dials it with `dialer`, and returns the dial result with the accepted side's
  async fn connect(
    listener: EndpointSpec,
    dialer_uri: &str,
  ) -> (
    Result<crate::util::stream::BoxedConnection, DialError>,
    Result<crate::util::stream::BoxedConnection, crate::common::driver::UpgradeError>,
  ) {
    let registry = DriverRegistry::with_builtin_drivers().unwrap();
    let mut bound = Pipeline::compile_endpoint(&registry, &listener)
      .unwrap()
      .bind(&listener.authority)
      .await
      .unwrap();
    let port = bound.local_addr().unwrap().port();
    let accepting = tokio::spawn(async move { bound.accept().await.unwrap().establish().await });

    let dialer_spec = EndpointSpec::parse(dialer_uri, EndpointRole::Dial).unwrap();
    let dialer = Pipeline::compile_endpoint(&registry, &dialer_spec)
      .unwrap()
      .dialer()
      .unwrap();
    let dialed = dialer.dial(&Authority::new("127.0.0.1", port)).await;
    (dialed, accepting.await.unwrap())
  }

  #[tokio::test]
  async fn named_server_with_private_anchor_round_trips() {
    let cert = self_signed(&["example.test"]);
    let (dialed, accepted) = connect(
      listener_spec(&cert),
      &format!(
        "tls://127.0.0.1:1?servername=example.test&ca={}",
        cert.cert
      ),
    )
    .await;
    let mut dialed = dialed.unwrap();
    let mut accepted = accepted.unwrap();
    assert_carries(&mut dialed, &mut accepted, b"hello over tls").await;
    assert_carries(&mut accepted, &mut dialed, b"and back again").await;
  }

  #[tokio::test]
  async fn pinned_dialer_accepts_only_the_pinned_key() {
    let cert = self_signed(&["example.test"]);
    let other = self_signed(&["example.test"]);

    let (dialed, accepted) = connect(
      listener_spec(&cert),
      &format!("tls://127.0.0.1:1?cert={}", cert.cert),
    )
    .await;
    let mut dialed = dialed.unwrap();
    let mut accepted = accepted.unwrap();
    dialed.write_all(b"pinned").await.unwrap();
    let mut buf = [0u8; 6];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pinned");

    let (dialed, accepted) = connect(
      listener_spec(&cert),
      &format!("tls://127.0.0.1:1?servername=example.test&cert={}", other.cert),
    )
    .await;
    match dialed {
      Err(DialError::Layer(error)) => {
        assert_eq!(error.layer.index, 0);
        assert_eq!(error.layer.name, "tls");
        assert!(
          error.source.is_verification(),
          "expected a verification failure, got {:?}",
          error.source
        );
      }
      Err(other) => panic!("Expected a layer failure, got {:?}", other),
      Ok(_) => panic!("Dial to an unpinned key must fail"),
    }
    assert!(accepted.is_err());
  }

  #[tokio::test]
  async fn untrusted_servers_fail_verification() {
    let cert = self_signed(&["example.test"]);
    let anchor = self_signed(&["example.test"]);
    let (dialed, _) = connect(
      listener_spec(&cert),
      &format!(
        "tls://127.0.0.1:1?servername=example.test&ca={}",
        anchor.cert
      ),
    )
    .await;
    let error = dialed.err().expect("untrusted server must be refused");
    assert!(matches!(
      error,
      DialError::Layer(ref e) if matches!(e.source, HandshakeError::Verification(_))
    ));
  }

  #[tokio::test]
  async fn conn_upgrades_work_without_a_server_name() {
    let cert = self_signed(&["example.test"]);
    let listener = TlsDriver
      .build(
        &params(&[("cert", cert.cert.as_str()), ("key", cert.key.as_str()), ("alpn", "x,y")]),
        Role::Listener,
      )
      .unwrap();
    let dialer = TlsDriver
      .build(
        &params(&[("cert", cert.cert.as_str()), ("alpn", "y")]),
        Role::Dialer,
      )
      .unwrap();
    let (accepted, dialed) = handshake_pair(&listener, &dialer).await;
    let (mut accepted, mut dialed) = (accepted.unwrap(), dialed.unwrap());
    assert_carries(&mut dialed, &mut accepted, b"negotiated").await;
  }

  #[test]
  fn dialers_reject_private_keys() {
    let cert = self_signed(&["example.test"]);
    let built = TlsDriver.build(
      &params(&[("servername", "example.test"), ("key", cert.key.as_str())]),
      Role::Dialer,
    );
    assert!(matches!(
      built,
      Err(DriverError::IncompatibleParameter { ref param, role: Role::Dialer }) if param == "key"
    ));
  }

  #[test]
  fn parameters_are_validated_at_build_time() {
    let cert = self_signed(&["example.test"]);
    assert!(matches!(
      TlsDriver.build(&params(&[("cert", cert.cert.as_str())]), Role::Listener),
      Err(DriverError::MissingParameter { ref param }) if param == "key"
    ));
    assert!(matches!(
      TlsDriver.build(&params(&[]), Role::Dialer),
      Err(DriverError::MissingParameter { ref param }) if param == "servername"
    ));
    assert!(matches!(
      TlsDriver.build(
        &params(&[("cert", "zz"), ("key", cert.key.as_str())]),
        Role::Listener
      ),
      Err(DriverError::Decode { ref param, .. }) if param == "cert"
    ));
    assert!(matches!(
      TlsDriver.build(
        &params(&[("cert", hex::encode("no pem here").as_str()), ("key", cert.key.as_str())]),
        Role::Listener
      ),
      Err(DriverError::Invalid { ref param, .. }) if param == "cert"
    ));
    assert!(matches!(
      TlsDriver.build(
        &params(&[("servername", "example.test"), ("verify", "no")]),
        Role::Dialer
      ),
      Err(DriverError::UnknownParameter { ref param }) if param == "verify"
    ));
  }
}
