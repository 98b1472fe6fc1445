//! Relay request handler
//!
//! Ties the pieces into an accept-verify-dial-splice state machine, fed
//! uniformly by raw TLS sockets and HTTP/2 requests:
//!
//! ```text
//! Accepted → InitRead → Authorized → Dialed → Spliced
//!                    ↘ Rejected (structured status back)
//! ```
//!
//! Terminal statuses go back through the substrate-appropriate channel:
//! framed OOB writes on raw sockets, response trailers on HTTP/2.

use crate::protocol::frame::{self, FragWriter};
use crate::protocol::{Command, Init, Protocol, Token, INIT_HEADER};
use crate::status::Status;
use crate::transport::h2conn::H2Stream;
use crate::transport::{BoxConn, Conn, Transport};
use crate::tunnel::splice;
use bytes::Bytes;
use semver::Version;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Called with every incoming proof token; rejecting fails the tunnel
/// attempt with a bad-request status carrying the given description.
pub type TokenHandler = Arc<dyn Fn(&Token) -> Result<(), String> + Send + Sync>;

/// Relay policy knobs.
pub struct RelayOptions {
    /// Size in bytes of the per-direction splice buffers.
    pub buf_size: usize,
    /// Maximum lifetime of a single tunnel; zero means unlimited.
    pub max_time: Duration,
    /// External proof-token collaborator.
    pub handle_token: Option<TokenHandler>,
    /// Origin string for statuses signalling this relay's own failures.
    pub error_origin: Option<String>,
    /// Allow dialing loopback addresses. Useful for tests, a security
    /// risk in production.
    pub allow_loopback: bool,
    /// Expected protocol version; only the minor is enforced.
    pub version: Version,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buf_size: crate::DEFAULT_BUF_SIZE,
            max_time: Duration::ZERO,
            handle_token: None,
            error_origin: None,
            allow_loopback: false,
            version: crate::protocol::proto_version(),
        }
    }
}

/// The relay handler.
pub struct Relay {
    transport: Arc<Transport>,
    options: RelayOptions,
    cancel: CancellationToken,
}

/// Loopback and unspecified addresses can both reach this relay's own
/// host, so they fall under the same guard.
fn is_loopback(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    match host.trim_matches(['[', ']']).parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        // probably a fqdn
        Err(_) => false,
    }
}

impl Relay {
    pub fn new(transport: Arc<Transport>, options: RelayOptions) -> Self {
        Self {
            transport,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancels all in-flight tunnels and stops the accept loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Authorizes the init payload and dials onward. On rejection the
    /// returned status is ready to send, origin included.
    async fn open_tunnel(
        &self,
        init: &Init,
        origin: Option<String>,
    ) -> Result<(BoxConn, Option<String>), Status> {
        if let Some(handler) = &self.options.handle_token {
            let accepted = match &init.token {
                Some(token) => handler(token),
                None => Err("missing token in payload".to_string()),
            };
            if let Err(desc) = accepted {
                return Err(Status::bad_request(desc).with_origin(origin));
            }
        }

        let remote = match &init.remote {
            Some(r) => r,
            None => {
                return Err(
                    Status::bad_request("missing remote in payload").with_origin(origin)
                )
            }
        };
        let protocol = init.protocol.unwrap_or(Protocol::Tcp);

        // signal target errors differently from mesh errors
        let origin = if remote.scheme() == "target" {
            Some("target".to_string())
        } else {
            origin
        };

        // no dials to this relay's own host
        let host = remote.host_str().unwrap_or_default();
        if !self.options.allow_loopback && is_loopback(host) {
            return Err(Status::bad_request(format!(
                "loopback address '{}' requested, refusing to dial",
                host
            ))
            .with_origin(origin));
        }

        info!("dialing {} connection to {}", protocol, shown(remote));
        match self.transport.dial_wl(None, protocol, remote, init).await {
            Ok(onward) => Ok((onward, origin)),
            Err(e) if e.is_timeout() => {
                Err(Status::request_timeout(e.to_string()).with_origin(origin))
            }
            Err(e) => Err(Status::bad_gateway(e.to_string()).with_origin(origin)),
        }
    }

    /// Splices the two sides; a failure becomes the terminal status to
    /// send back, written by the caller before the final close.
    async fn run_tunnel<C: Conn>(
        &self,
        inbound: &mut C,
        mut onward: BoxConn,
        origin: Option<String>,
    ) -> Option<Status> {
        let res = splice(
            &self.cancel,
            inbound,
            &mut onward,
            self.options.max_time,
            self.options.buf_size,
        )
        .await;
        match res {
            Ok(()) => None,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                Some(Status::request_timeout(e.to_string()).with_origin(origin))
            }
            Err(e) => Some(Status::gone(e.to_string()).with_origin(origin)),
        }
    }

    /// Serves one raw-substrate connection: framed init in, framed OOB
    /// statuses out.
    pub async fn serve_raw<C: Conn>(&self, mut conn: C) {
        let origin = self.options.error_origin.clone();

        let init = match frame::read_init(&mut conn, self.options.version.minor).await {
            Ok(init) => init,
            Err(e) => {
                let st = Status::bad_request(e.to_string()).with_origin(origin);
                frame::write_status(&mut conn, &st).await.ok();
                return;
            }
        };

        if init.command == Command::Ping {
            // raw, not in wire format
            let st = Status::pong().with_origin(origin);
            conn.write_all(&st.to_json()).await.ok();
            conn.shutdown().await.ok();
            return;
        }

        let is_target = init
            .remote
            .as_ref()
            .map(|r| r.scheme() == "target")
            .unwrap_or(false);

        match self.open_tunnel(&init, origin).await {
            Err(st) => {
                frame::write_status(&mut conn, &st).await.ok();
            }
            Ok((onward, origin)) => {
                // the final hop frames its response stream so OOB
                // statuses can travel back through the mesh
                let (failure, mut conn) = if is_target {
                    let mut framed = FragWriter::new(conn);
                    let failure = self.run_tunnel(&mut framed, onward, origin).await;
                    // drain any staged frame so the status below lands
                    // on a frame boundary
                    framed.flush().await.ok();
                    (failure, framed.into_inner())
                } else {
                    let failure = self.run_tunnel(&mut conn, onward, origin).await;
                    (failure, conn)
                };
                if let Some(st) = failure {
                    // status before close, while the socket still writes
                    frame::write_status(&mut conn, &st).await.ok();
                }
                conn.shutdown().await.ok();
            }
        }
    }

    /// Serves one HTTP/2 connection, accepting streaming PUT requests
    /// until the peer goes away.
    pub async fn serve_h2<C>(self: Arc<Self>, io: C) -> crate::Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = h2::server::handshake(io).await?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = conn.accept() => match accepted {
                    Some(request) => {
                        let (req, respond) = request?;
                        let relay = self.clone();
                        tokio::spawn(async move {
                            relay.handle_h2_request(req, respond).await;
                        });
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    async fn handle_h2_request(
        &self,
        req: http::Request<h2::RecvStream>,
        mut respond: h2::server::SendResponse<Bytes>,
    ) {
        let origin = self.options.error_origin.clone();

        if req.method() != http::Method::PUT {
            let st = Status::method_not_allowed().with_origin(origin);
            let response = empty_response(http::StatusCode::METHOD_NOT_ALLOWED);
            if let Ok(mut send) = respond.send_response(response, false) {
                send.send_data(Bytes::from(st.to_json()), true).ok();
            }
            return;
        }

        let parsed = req
            .headers()
            .get(INIT_HEADER)
            .ok_or_else(|| format!("missing {} header", INIT_HEADER))
            .and_then(|v| {
                Init::from_header(v.as_bytes(), self.options.version.minor)
                    .map_err(|e| e.to_string())
            });

        let init = match parsed {
            Ok(init) => init,
            Err(desc) => {
                let st = Status::bad_request(desc).with_origin(origin);
                self.reject_h2(req, respond, &st);
                return;
            }
        };

        if init.command == Command::Ping {
            let st = Status::pong().with_origin(origin);
            let response = empty_response(http::StatusCode::OK);
            if let Ok(mut send) = respond.send_response(response, false) {
                send.send_data(Bytes::from(st.to_json()), true).ok();
            }
            return;
        }

        let response = empty_response(http::StatusCode::OK);
        let send = match respond.send_response(response, false) {
            Ok(send) => send,
            Err(e) => {
                debug!("h2 response refused: {}", e);
                return;
            }
        };
        let mut stream = H2Stream::new(req.into_body(), send);

        let is_target = init
            .remote
            .as_ref()
            .map(|r| r.scheme() == "target")
            .unwrap_or(false);

        match self.open_tunnel(&init, origin).await {
            Err(st) => {
                stream.send_trailers(&st).ok();
            }
            Ok((onward, origin)) => {
                let (failure, mut stream) = if is_target {
                    let mut framed = FragWriter::new(stream);
                    let failure = self.run_tunnel(&mut framed, onward, origin).await;
                    framed.flush().await.ok();
                    (failure, framed.into_inner())
                } else {
                    let failure = self.run_tunnel(&mut stream, onward, origin).await;
                    (failure, stream)
                };
                match failure {
                    Some(st) => {
                        stream.send_trailers(&st).ok();
                    }
                    None => {
                        stream.shutdown().await.ok();
                    }
                }
            }
        }
    }

    fn reject_h2(
        &self,
        req: http::Request<h2::RecvStream>,
        mut respond: h2::server::SendResponse<Bytes>,
        status: &Status,
    ) {
        let response = empty_response(http::StatusCode::OK);
        if let Ok(send) = respond.send_response(response, false) {
            let mut stream = H2Stream::new(req.into_body(), send);
            stream.send_trailers(status).ok();
        }
    }

    /// Accept loop with ALPN dispatch: `h2` goes to the HTTP/2 handler,
    /// everything else is treated as the raw substrate.
    pub async fn serve_listener(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
    ) -> crate::Result<()> {
        info!("relay listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let acceptor = acceptor.clone();
                    let relay = self.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(socket).await {
                            Ok(tls) => {
                                if tls.get_ref().1.alpn_protocol() == Some(&b"h2"[..]) {
                                    if let Err(e) = relay.serve_h2(tls).await {
                                        debug!("h2 connection from {} ended: {}", peer, e);
                                    }
                                } else {
                                    relay.serve_raw(tls).await;
                                }
                            }
                            Err(e) => debug!("TLS accept from {} failed: {}", peer, e),
                        }
                    });
                }
            }
        }
    }
}

fn empty_response(status: http::StatusCode) -> http::Response<()> {
    let mut response = http::Response::new(());
    *response.status_mut() = status;
    response
}

/// Requested targets stay private in logs; relay hops may be shown.
fn shown(remote: &Url) -> String {
    if remote.scheme() == "target" {
        "(target)".to_string()
    } else {
        remote.to_string()
    }
}
