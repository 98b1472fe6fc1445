//! The mesh dialer
//!
//! [`Transport`] resolves a destination URL to a connection. `target://`
//! destinations are dialed plainly (the final hop), `wireleap://`
//! destinations become HTTP/2 streams over TLS 1.3 — optionally over a
//! pinned prior-hop connection, which is how a multi-hop tunnel is
//! extended through the connection just accepted.

use super::h2conn::StreamConn;
use super::{BoxConn, TransportError, UdpConn};
use crate::protocol::{Init, Protocol};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::{Host, Url};

/// Options for initializing a [`Transport`].
pub struct TransportOptions {
    /// Verify server TLS certificates. Disabling this is only sound
    /// inside a mesh that authenticates hops at another layer.
    pub tls_verify: bool,
    /// Optional client certificate chain and key.
    pub certs: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    /// Maximum time for establishing new connections.
    pub timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            tls_verify: true,
            certs: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// A mesh transport dialing relays via HTTP/2 over TLS and targets via
/// TCP or UDP.
pub struct Transport {
    connector: TlsConnector,
    timeout: Duration,
    /// Pinned prior-hop connection, checked out wholesale by the next
    /// `wireleap` dial.
    pinned: Mutex<Option<BoxConn>>,
}

impl Transport {
    pub fn new(opts: TransportOptions) -> Result<Self, TransportError> {
        let builder =
            rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);
        let builder = if opts.tls_verify {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerify))
        };
        let mut config = match opts.certs {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            timeout: opts.timeout,
            pinned: Mutex::new(None),
        })
    }

    /// Pins a prior-hop connection. The next `wireleap` dial uses it as
    /// its socket instead of opening a new one.
    pub async fn pin(&self, conn: BoxConn) {
        *self.pinned.lock().await = Some(conn);
    }

    /// Hands back the pinned connection if one is set, otherwise opens
    /// a fresh TCP connection.
    pub async fn dial_socket(&self, host: &str, port: u16) -> Result<BoxConn, TransportError> {
        if let Some(conn) = self.pinned.lock().await.take() {
            return Ok(conn);
        }
        let addr = self.resolve(Protocol::Tcp, host, port).await?;
        let conn = timeout(self.timeout, TcpStream::connect(addr)).await??;
        Ok(Box::new(conn))
    }

    async fn resolve(
        &self,
        protocol: Protocol,
        host: &str,
        port: u16,
    ) -> Result<SocketAddr, TransportError> {
        let addrs: Vec<SocketAddr> = timeout(self.timeout, lookup_host((host, port)))
            .await??
            .collect();
        let addr = match protocol {
            Protocol::Tcp | Protocol::Udp => addrs.into_iter().next(),
            Protocol::Tcp4 | Protocol::Udp4 => addrs.into_iter().find(|a| a.is_ipv4()),
            Protocol::Tcp6 | Protocol::Udp6 => addrs.into_iter().find(|a| a.is_ipv6()),
        };
        addr.ok_or_else(|| TransportError::NoAddress(format!("{}:{}", host, port)))
    }

    async fn dial_target(
        &self,
        protocol: Protocol,
        remote: &Url,
    ) -> Result<BoxConn, TransportError> {
        let port = remote
            .port()
            .ok_or_else(|| TransportError::InvalidRemote(format!("missing port in {}", remote)))?;
        let addr = match remote.host() {
            Some(Host::Ipv4(ip)) => SocketAddr::from((ip, port)),
            Some(Host::Ipv6(ip)) => SocketAddr::from((ip, port)),
            Some(Host::Domain(d)) => self.resolve(protocol, d, port).await?,
            None => {
                return Err(TransportError::InvalidRemote(format!(
                    "missing host in {}",
                    remote
                )))
            }
        };
        if protocol.is_udp() {
            Ok(Box::new(UdpConn::connect(addr).await?))
        } else {
            let conn = timeout(self.timeout, TcpStream::connect(addr)).await??;
            Ok(Box::new(conn))
        }
    }

    async fn dial_relay(
        &self,
        c0: Option<BoxConn>,
        remote: &Url,
        init: &Init,
    ) -> Result<BoxConn, TransportError> {
        if let Some(conn) = c0 {
            self.pin(conn).await;
        }
        let host = remote
            .host_str()
            .ok_or_else(|| TransportError::InvalidRemote(format!("missing host in {}", remote)))?
            .trim_matches(['[', ']'])
            .to_string();
        let port = remote.port().unwrap_or(443);

        let socket = self.dial_socket(&host, port).await?;
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| TransportError::InvalidRemote(e.to_string()))?;
        let tls = timeout(self.timeout, self.connector.connect(server_name, socket)).await??;

        let (send_req, connection) = timeout(self.timeout, h2::client::handshake(tls)).await??;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("h2 connection terminated: {}", e);
            }
        });
        let mut send_req = timeout(self.timeout, send_req.ready()).await??;

        // rewrite to the substrate's native scheme
        let uri: http::Uri = format!("https://{}:{}{}", host, port, remote.path())
            .parse()
            .map_err(|e: http::uri::InvalidUri| TransportError::InvalidRemote(e.to_string()))?;
        let conn = StreamConn::new(&mut send_req, uri, init)?;
        Ok(Box::new(conn))
    }

    /// Creates a new connection to a relay or target.
    ///
    /// `c0`, when given, is pinned first so the `wireleap` dial tunnels
    /// through it; `target` dials ignore both `c0` and `init`.
    pub async fn dial_wl(
        &self,
        c0: Option<BoxConn>,
        protocol: Protocol,
        remote: &Url,
        init: &Init,
    ) -> Result<BoxConn, TransportError> {
        match remote.scheme() {
            "target" => self.dial_target(protocol, remote).await,
            "wireleap" => self.dial_relay(c0, remote, init).await,
            other => Err(TransportError::UnsupportedScheme(other.to_string())),
        }
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Hop authenticity inside the mesh
    /// is established by the directory layer, not by web PKI.
    #[derive(Debug)]
    pub(super) struct NoVerify;

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{proto_version, Command, Init};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn transport() -> Transport {
        Transport::new(TransportOptions {
            tls_verify: false,
            certs: None,
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    fn ping_init() -> Init {
        Init {
            command: Command::Ping,
            protocol: None,
            remote: None,
            token: None,
            version: proto_version(),
        }
    }

    #[tokio::test]
    async fn test_unsupported_scheme_fails_fast() {
        let t = transport();
        let remote = Url::parse("ftp://example.invalid:21").unwrap();
        match t
            .dial_wl(None, Protocol::Tcp, &remote, &ping_init())
            .await
        {
            Err(TransportError::UnsupportedScheme(s)) => assert_eq!(s, "ftp"),
            other => panic!("expected scheme error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_pinned_connection_is_reused() {
        let t = transport();
        let (ours, theirs) = tokio::io::duplex(256);
        t.pin(Box::new(theirs)).await;

        // the dial must hand back the pinned sentinel, not a socket
        let mut conn = t.dial_socket("example.invalid", 13).await.unwrap();
        conn.write_all(b"sentinel").await.unwrap();

        let mut ours = ours;
        let mut buf = [0u8; 8];
        ours.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"sentinel");

        // the slot is consumed: nothing pinned for the next dial
        assert!(t.pinned.lock().await.is_none());
    }

    #[test]
    fn test_transport_moves_between_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Transport>();
    }

    #[tokio::test]
    async fn test_dial_target_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let t = transport();
        let remote = Url::parse(&format!("target://127.0.0.1:{}", addr.port())).unwrap();
        let mut conn = t
            .dial_wl(None, Protocol::Tcp, &remote, &ping_init())
            .await
            .unwrap();

        let (mut peer, _) = accept.await.unwrap();
        conn.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
