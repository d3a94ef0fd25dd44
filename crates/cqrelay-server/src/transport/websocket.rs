//! WebSocket listener and upstream dialer using tokio-tungstenite.
//!
//! The listener performs the upgrade with a header callback so that wrong
//! paths and bad tokens are answered with an HTTP error before any session
//! exists. Accepted connections are handed to the server through a channel.

use crate::auth;
use crate::config::TokenPlacement;
use crate::relay::SessionState;
use cqrelay_core::{RelayError, RelayResult};
use futures_util::{Sink, SinkExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as ClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

/// Upstream connection type.
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A framework connection that passed the handshake gate.
pub struct ClientConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Path and token requirements checked during the upgrade.
#[derive(Debug, Clone)]
pub struct HandshakeGate {
    pub path: String,
    pub access_token: Option<String>,
}

impl HandshakeGate {
    /// Handshake callback body: pass the response through or reject.
    fn check(&self, remote: SocketAddr, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let uri = request.uri();
        if uri.path() != self.path {
            debug!(remote = %remote, path = %uri.path(), "rejected upgrade on unknown path");
            return Err(error_response(StatusCode::NOT_FOUND, "not found"));
        }

        let authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !auth::is_authorized(self.access_token.as_deref(), authorization) {
            warn!(remote = %remote, "rejected upgrade: bad or missing access token");
            return Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized"));
        }

        Ok(response)
    }
}

fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    gate: HandshakeGate,
) -> RelayResult<(SocketAddr, mpsc::Receiver<ClientConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %gate.path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<ClientConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let gate = gate.clone();
                    tokio::spawn(async move {
                        debug!(remote = %addr, state = %SessionState::Connecting, "session state");
                        let callback = |req: &Request, resp: Response| gate.check(addr, req, resp);
                        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = ClientConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Build the upstream handshake request with the token attached.
pub fn upstream_request(
    url: &Url,
    token: Option<&str>,
    placement: TokenPlacement,
) -> RelayResult<ClientRequest> {
    let mut url = url.clone();
    if let (Some(token), TokenPlacement::Query) = (token, placement) {
        let others: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "access_token")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(others)
            .append_pair("access_token", token);
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::Handshake(format!("invalid upstream request: {e}")))?;

    if let (Some(token), TokenPlacement::Header) = (token, placement) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| RelayError::Config(format!("invalid upstream token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    Ok(request)
}

/// Dial the upstream gateway.
pub async fn dial_upstream(
    url: &Url,
    token: Option<&str>,
    placement: TokenPlacement,
) -> RelayResult<UpstreamStream> {
    let request = upstream_request(url, token, placement)?;
    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| RelayError::Transport(format!("upstream connect error: {e}")))?;
    debug!(url = %url, "upstream connected");
    Ok(ws_stream)
}

/// Send a close frame, giving up after `timeout`. Failures are only logged.
pub async fn send_close<Si>(sink: &mut Si, code: CloseCode, timeout: Duration)
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: "".into(),
    };
    match tokio::time::timeout(timeout, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "close notification not delivered"),
        Err(_) => debug!("close notification timed out"),
    }
}
