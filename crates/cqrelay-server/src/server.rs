//! Core server: accepts framework connections and runs one session each.
//!
//! Owns the configuration and the shared interceptor. Every accepted
//! connection gets a session id, an upstream dial and a duplex bridge; no
//! state is shared between sessions beyond the read-only interceptor.

use crate::config::RelayConfig;
use crate::relay::{self, BridgeOptions, SessionState};
use crate::transport::websocket::{self, send_close, ClientConnection, HandshakeGate};
use cqrelay_core::{Interceptor, MediaResolver, RelayResult};
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

/// The relay server instance.
pub struct RelayServer<R> {
    /// Relay configuration.
    config: RelayConfig,
    /// Rewrites outbound commands; shared by all sessions.
    interceptor: Arc<Interceptor<R>>,
    /// Next session id.
    next_session: AtomicU64,
}

impl<R: MediaResolver + 'static> RelayServer<R> {
    /// Create a new server instance.
    pub fn new(config: RelayConfig, resolver: R) -> Self {
        Self {
            config,
            interceptor: Arc::new(Interceptor::new(resolver)),
            next_session: AtomicU64::new(1),
        }
    }

    fn gate(&self) -> HandshakeGate {
        HandshakeGate {
            path: self.config.path.clone(),
            access_token: self.config.access_token.clone(),
        }
    }

    /// Bind the listener and serve until the process stops.
    pub async fn run(self) -> RelayResult<()> {
        let (local_addr, connections) =
            websocket::start_listener(self.config.listen, self.gate()).await?;
        info!(
            addr = %local_addr,
            path = %self.config.path,
            upstream = %self.config.upstream_url,
            "relay listening"
        );
        self.serve(connections).await;
        Ok(())
    }

    /// Bind on an explicit address and serve in the background.
    pub async fn spawn(self, bind_addr: SocketAddr) -> RelayResult<SocketAddr> {
        let (local_addr, connections) = websocket::start_listener(bind_addr, self.gate()).await?;
        tokio::spawn(self.serve(connections));
        Ok(local_addr)
    }

    /// Run a session for every accepted connection.
    pub async fn serve(self, mut connections: mpsc::Receiver<ClientConnection>) {
        let server = Arc::new(self);
        while let Some(conn) = connections.recv().await {
            let session = server.next_session.fetch_add(1, Ordering::Relaxed);
            let server = server.clone();
            tokio::spawn(async move {
                server.handle_connection(session, conn).await;
            });
        }
    }

    async fn handle_connection(&self, session: u64, conn: ClientConnection) {
        let ClientConnection {
            mut ws_stream,
            remote_addr,
        } = conn;
        info!(session, remote = %remote_addr, "framework connected");
        debug!(session, state = %SessionState::Authenticated, "session state");

        let upstream = match websocket::dial_upstream(
            &self.config.upstream_url,
            self.config.upstream_token.as_deref(),
            self.config.token_placement,
        )
        .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(session, error = %e, "upstream dial failed, dropping client");
                send_close(&mut ws_stream, CloseCode::Error, self.config.close_timeout).await;
                let closing = SinkExt::close(&mut ws_stream);
                let _ = tokio::time::timeout(self.config.close_timeout, closing).await;
                return;
            }
        };

        let options = BridgeOptions {
            queue_capacity: self.config.queue_capacity,
            close_timeout: self.config.close_timeout,
        };
        relay::bridge(session, ws_stream, upstream, self.interceptor.clone(), options).await;
        info!(session, remote = %remote_addr, "session closed");
    }
}
