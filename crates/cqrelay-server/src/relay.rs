//! Duplex bridging of one client/upstream connection pair.
//!
//! ```text
//! client ──read──▶ [queue] ──intercept──▶ upstream     (client→upstream)
//! client ◀──────────────────────────────── upstream     (upstream→client)
//! ```
//!
//! The client→upstream direction is a reader task feeding a bounded queue and
//! a forwarder task that rewrites text frames in order. A slow upload holds
//! back only that session's outbound frames; the client socket keeps being
//! read until the queue is full and the other direction is unaffected.
//!
//! Whichever direction ends first raises the session's done flag and sends a
//! normal-closure frame on the connection it writes to. The session returns
//! once all tasks have finished, after closing both sinks.

use crate::transport::websocket::send_close;
use cqrelay_core::{Interceptor, MediaResolver};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// Lifecycle of a session, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Bridging,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Bridging => "bridging",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Per-session tuning.
#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    /// Frames buffered between the client reader and the upstream forwarder.
    pub queue_capacity: usize,
    /// Bound on close notifications and final sink closes.
    pub close_timeout: Duration,
}

/// Relay frames between `client` and `upstream` until either side ends.
pub async fn bridge<R, C, U>(
    session: u64,
    client: C,
    upstream: U,
    interceptor: Arc<Interceptor<R>>,
    options: BridgeOptions,
) where
    R: MediaResolver + 'static,
    C: Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
    U: Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    debug!(session, state = %SessionState::Bridging, "session state");

    let (client_sink, client_stream) = client.split();
    let (upstream_sink, upstream_stream) = upstream.split();

    let (queue_tx, queue_rx) = mpsc::channel::<Message>(options.queue_capacity.max(1));
    let (done_tx, done_rx) = watch::channel(false);
    let done_tx = Arc::new(done_tx);

    let reader = tokio::spawn(read_client(session, client_stream, queue_tx, done_rx.clone()));
    let forwarder = tokio::spawn(forward_upstream(
        session,
        queue_rx,
        upstream_sink,
        interceptor,
        done_tx.clone(),
        options.close_timeout,
    ));
    let downstream = tokio::spawn(forward_client(
        session,
        upstream_stream,
        client_sink,
        done_rx,
        done_tx,
        options.close_timeout,
    ));

    let (reader, forwarder, downstream) = tokio::join!(reader, forwarder, downstream);
    debug!(session, state = %SessionState::Closing, "session state");

    if let Err(e) = reader {
        error!(session, error = %e, "client reader task failed");
    }
    match forwarder {
        Ok(mut sink) => close_sink(&mut sink, options.close_timeout).await,
        Err(e) => error!(session, error = %e, "upstream forwarder task failed"),
    }
    match downstream {
        Ok(mut sink) => close_sink(&mut sink, options.close_timeout).await,
        Err(e) => error!(session, error = %e, "client forwarder task failed"),
    }

    debug!(session, state = %SessionState::Closed, "session state");
}

async fn close_sink<Si>(sink: &mut Si, timeout: Duration)
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let _ = tokio::time::timeout(timeout, sink.close()).await;
}

/// Resolves once the session's done flag is raised.
async fn session_done(done: &mut watch::Receiver<bool>) {
    // A dropped sender also means the session is over.
    let _ = done.wait_for(|finished| *finished).await;
}

/// Client socket → queue. Stops on client close/error or when the session ends.
async fn read_client<St>(
    session: u64,
    mut stream: St,
    queue: mpsc::Sender<Message>,
    mut done: watch::Receiver<bool>,
) where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = session_done(&mut done) => break,
            _ = queue.closed() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                if queue.send(msg).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(session, ?frame, "client sent close");
                break;
            }
            // Ping/pong are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session, error = %e, "client read ended");
                break;
            }
            None => break,
        }
    }
}

/// Queue → interceptor → upstream socket. Returns the upstream sink.
async fn forward_upstream<R, Si>(
    session: u64,
    mut queue: mpsc::Receiver<Message>,
    mut sink: Si,
    interceptor: Arc<Interceptor<R>>,
    done: Arc<watch::Sender<bool>>,
    close_timeout: Duration,
) -> Si
where
    R: MediaResolver,
    Si: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(msg) = queue.recv().await {
        let msg = match msg {
            Message::Text(text) => Message::Text(interceptor.intercept(text).await),
            other => other,
        };
        if let Err(e) = sink.send(msg).await {
            warn!(session, error = %e, "upstream write failed");
            break;
        }
    }
    queue.close();

    done.send_replace(true);
    send_close(&mut sink, CloseCode::Normal, close_timeout).await;
    info!(session, "client→upstream direction finished");
    sink
}

/// Upstream socket → client socket, untouched. Returns the client sink.
async fn forward_client<St, Si>(
    session: u64,
    mut stream: St,
    mut sink: Si,
    mut done: watch::Receiver<bool>,
    done_tx: Arc<watch::Sender<bool>>,
    close_timeout: Duration,
) -> Si
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
    Si: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = session_done(&mut done) => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                if let Err(e) = sink.send(msg).await {
                    warn!(session, error = %e, "client write failed");
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(session, ?frame, "upstream sent close");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session, error = %e, "upstream read ended");
                break;
            }
            None => break,
        }
    }

    done_tx.send_replace(true);
    send_close(&mut sink, CloseCode::Normal, close_timeout).await;
    info!(session, "upstream→client direction finished");
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrelay_core::{ResolveError, ResolvedMedia};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct NoopResolver;

    impl MediaResolver for NoopResolver {
        async fn resolve(&self, _: &str, _: &str) -> Result<ResolvedMedia, ResolveError> {
            Err(ResolveError::NoEndpoint)
        }
    }

    /// In-memory WebSocket stand-in: frames written to it show up on `written`,
    /// frames pushed into `incoming` are read from it.
    struct MemSocket {
        incoming: mpsc::UnboundedReceiver<Result<Message, WsError>>,
        written: mpsc::UnboundedSender<Message>,
    }

    impl Stream for MemSocket {
        type Item = Result<Message, WsError>;
        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.incoming.poll_recv(cx)
        }
    }

    impl Sink<Message> for MemSocket {
        type Error = WsError;
        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            self.written.send(item).map_err(|_| WsError::ConnectionClosed)
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
    }

    type Feed = mpsc::UnboundedSender<Result<Message, WsError>>;
    type Written = mpsc::UnboundedReceiver<Message>;

    fn mem_socket() -> (MemSocket, Feed, Written) {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        (
            MemSocket {
                incoming: feed_rx,
                written: written_tx,
            },
            feed_tx,
            written_rx,
        )
    }

    fn options() -> BridgeOptions {
        BridgeOptions {
            queue_capacity: 4,
            close_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn forwards_both_directions_and_closes_on_client_close() {
        let (client, client_feed, mut client_written) = mem_socket();
        let (upstream, upstream_feed, mut upstream_written) = mem_socket();
        let interceptor = Arc::new(Interceptor::new(NoopResolver));

        let session = tokio::spawn(bridge(1, client, upstream, interceptor, options()));

        client_feed.send(Ok(Message::Text("heartbeat".into()))).unwrap();
        client_feed.send(Ok(Message::Binary(vec![1, 2, 3]))).unwrap();
        assert_eq!(upstream_written.recv().await, Some(Message::Text("heartbeat".into())));
        assert_eq!(upstream_written.recv().await, Some(Message::Binary(vec![1, 2, 3])));

        upstream_feed
            .send(Ok(Message::Text("[CQ:image,file=/tmp/x.png]".into())))
            .unwrap();
        assert_eq!(
            client_written.recv().await,
            Some(Message::Text("[CQ:image,file=/tmp/x.png]".into()))
        );

        client_feed.send(Ok(Message::Close(None))).unwrap();
        match upstream_written.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {other:?}"),
        }

        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("session should end")
            .unwrap();
    }

    #[tokio::test]
    async fn upstream_failure_notifies_client_and_ends_session() {
        let (client, _client_feed, mut client_written) = mem_socket();
        let (upstream, upstream_feed, _upstream_written) = mem_socket();
        let interceptor = Arc::new(Interceptor::new(NoopResolver));

        let session = tokio::spawn(bridge(2, client, upstream, interceptor, options()));

        upstream_feed.send(Err(WsError::ConnectionClosed)).unwrap();
        match client_written.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {other:?}"),
        }

        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("session should end")
            .unwrap();
    }
}
