/*!
 * @file server.rs
 * @brief Mock MongoDB server: accept loop, request queue, and teardown
 */

use crate::config::ServerOptions;
use crate::connection::ConnectionHandle;
use crate::error::{MockError, Result};
use crate::frame::{FrameDecoder, FrameEvent};
use crate::protocol;
use crate::request::Request;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Handler invoked with a request instead of queueing it.
pub type MessageHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, ()> + Send + Sync>;

/// Diagnostic record for bytes that failed to frame or parse on one
/// connection. Other connections are unaffected; the offending connection's
/// parse state has already been reset.
#[derive(Debug)]
pub struct ParseErrorEvent {
    pub connection_id: u64,
    pub error: MockError,
    pub bin: Bytes,
}

#[derive(Default)]
struct HandlerTable {
    generic: Option<MessageHandler>,
    by_command: HashMap<String, MessageHandler>,
}

struct ServerInner {
    addr: SocketAddr,
    options: ServerOptions,
    requests_tx: mpsc::UnboundedSender<Request>,
    requests_rx: Mutex<mpsc::UnboundedReceiver<Request>>,
    errors_tx: mpsc::UnboundedSender<ParseErrorEvent>,
    errors_rx: Mutex<mpsc::UnboundedReceiver<ParseErrorEvent>>,
    destroyed: AtomicBool,
    destroyed_tx: watch::Sender<bool>,
    connections: parking_lot::Mutex<Vec<ConnectionHandle>>,
    connection_seq: AtomicU64,
    handlers: RwLock<HandlerTable>,
}

/// A scriptable mock MongoDB server.
///
/// Accepts connections, reassembles and parses wire messages, and queues
/// each one as a [`Request`] for test code to pull with [`receive`]. The
/// queue is unbounded: a test that never calls `receive()` simply
/// accumulates backlog.
///
/// Cloning is cheap and shares the same server.
///
/// [`receive`]: MockServer::receive
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<ServerInner>,
}

impl MockServer {
    /// Binds and starts listening; resolves once the listener is live. Port
    /// 0 picks a free port, visible via [`address`](MockServer::address).
    /// Bind failure surfaces here.
    pub async fn bind(host: &str, port: u16, options: ServerOptions) -> Result<MockServer> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (destroyed_tx, _) = watch::channel(false);

        let inner = Arc::new(ServerInner {
            addr,
            options,
            requests_tx,
            requests_rx: Mutex::new(requests_rx),
            errors_tx,
            errors_rx: Mutex::new(errors_rx),
            destroyed: AtomicBool::new(false),
            destroyed_tx,
            connections: parking_lot::Mutex::new(Vec::new()),
            connection_seq: AtomicU64::new(0),
            handlers: RwLock::new(HandlerTable::default()),
        });

        tokio::spawn(accept_loop(inner.clone(), listener));
        info!(%addr, "mock server listening");

        Ok(MockServer { inner })
    }

    /// Actual bound address.
    pub fn address(&self) -> SocketAddr {
        self.inner.addr
    }

    /// `host:port` form of the bound address (IPv6 hosts bracketed).
    pub fn uri(&self) -> String {
        self.inner.addr.to_string()
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Pulls the next queued request, FIFO across all connections, waiting
    /// if the queue is empty. Concurrent callers each get a distinct
    /// request exactly once.
    ///
    /// Fails with [`MockError::ServerDestroyed`] once the server has been
    /// destroyed, even if requests were still queued.
    pub async fn receive(&self) -> Result<Request> {
        let mut destroyed = self.inner.destroyed_tx.subscribe();
        if *destroyed.borrow_and_update() {
            return Err(MockError::ServerDestroyed);
        }

        let mut rx = self.inner.requests_rx.lock().await;
        tokio::select! {
            request = rx.recv() => request.ok_or(MockError::ServerDestroyed),
            _ = destroyed.changed() => Err(MockError::ServerDestroyed),
        }
    }

    /// Waits for the next parse diagnostic. Returns `None` once the server
    /// is destroyed.
    pub async fn parse_error(&self) -> Option<ParseErrorEvent> {
        let mut destroyed = self.inner.destroyed_tx.subscribe();
        if *destroyed.borrow_and_update() {
            return None;
        }

        let mut rx = self.inner.errors_rx.lock().await;
        tokio::select! {
            event = rx.recv() => event,
            _ = destroyed.changed() => None,
        }
    }

    /// Non-blocking variant of [`parse_error`](MockServer::parse_error).
    pub fn try_parse_error(&self) -> Option<ParseErrorEvent> {
        self.inner.errors_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Installs a generic handler that receives every request instead of
    /// the queue.
    pub fn set_message_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.handlers.write().generic = Some(box_handler(handler));
    }

    /// Installs a handler for requests whose document's first key equals
    /// `command` (e.g. `"ismaster"`). A generic handler, if set, takes
    /// precedence. Unmatched requests still go to the queue.
    pub fn add_message_handler<F, Fut>(&self, command: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .handlers
            .write()
            .by_command
            .insert(command.to_string(), box_handler(handler));
    }

    /// Stops accepting connections and force-closes all live ones.
    /// Idempotent: calling it again (or after the listener is already gone)
    /// is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.inner.destroyed_tx.send(true);
        let connections: Vec<ConnectionHandle> =
            self.inner.connections.lock().drain(..).collect();
        for connection in connections {
            connection.destroy().await;
        }

        debug!(addr = %self.inner.addr, "mock server destroyed");
        Ok(())
    }
}

fn box_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |request| Box::pin(handler(request)))
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    let mut destroyed = inner.destroyed_tx.subscribe();

    loop {
        tokio::select! {
            _ = destroyed.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = inner.connection_seq.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, id, "accepted connection");
                    spawn_connection(inner.clone(), stream, peer, id);
                }
                Err(e) => {
                    // Keep accepting even if one accept fails.
                    warn!("failed to accept connection: {}", e);
                }
            }
        }
    }
}

fn spawn_connection(inner: Arc<ServerInner>, stream: TcpStream, peer: SocketAddr, id: u64) {
    let (mut read_half, write_half) = stream.into_split();
    let (handle, mut close_rx) = ConnectionHandle::new(id, peer, write_half);
    inner.connections.lock().push(handle.clone());

    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new(inner.options.max_message_size);
        let mut buf = vec![0u8; 4096];

        loop {
            let n = tokio::select! {
                _ = close_rx.changed() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(id, "connection read error: {}", e);
                        break;
                    }
                }
            };

            for event in decoder.push(&buf[..n]) {
                match event {
                    FrameEvent::Message(bytes) => handle_frame(&inner, &handle, bytes),
                    FrameEvent::BadLength { declared, bin } => {
                        warn!(id, declared, "invalid wire message size");
                        let _ = inner.errors_tx.send(ParseErrorEvent {
                            connection_id: id,
                            error: MockError::Frame(format!(
                                "invalid message size: {}",
                                declared
                            )),
                            bin,
                        });
                    }
                }
            }
        }

        handle.destroy().await;
        inner.connections.lock().retain(|c| c.id() != id);
        debug!(id, "connection closed");
    });
}

fn handle_frame(inner: &Arc<ServerInner>, connection: &ConnectionHandle, bytes: Bytes) {
    match protocol::parse_message(&bytes) {
        Ok(message) => dispatch_request(inner, Request::new(message, connection.clone())),
        Err(error) => {
            // One bad message never takes the connection down; framing
            // resumes with the next message.
            warn!(id = connection.id(), "failed to parse message: {}", error);
            let _ = inner.errors_tx.send(ParseErrorEvent {
                connection_id: connection.id(),
                error,
                bin: bytes,
            });
        }
    }
}

fn dispatch_request(inner: &Arc<ServerInner>, request: Request) {
    let handler = {
        let table = inner.handlers.read();
        if let Some(generic) = &table.generic {
            Some(generic.clone())
        } else {
            request
                .document()
                .and_then(|doc| doc.keys().next())
                .and_then(|command| table.by_command.get(command).cloned())
        }
    };

    match handler {
        Some(handler) => {
            tokio::spawn(handler(request));
        }
        None => {
            let _ = inner.requests_tx.send(request);
        }
    }
}

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DRAIN_POLL_LIMIT: u32 = 200;

/// Test-suite teardown: waits briefly for each server's open connections to
/// drain (capped, so teardown cannot hang on a client that never
/// disconnects), then destroys every server. The first destroy error, if
/// any, is returned after all servers have been torn down.
pub async fn cleanup(servers: Vec<MockServer>) -> Result<()> {
    for server in &servers {
        let mut polls = 0;
        while server.connection_count() > 0 && polls < DRAIN_POLL_LIMIT {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            polls += 1;
        }
    }

    let mut first_err = None;
    for server in servers {
        if let Err(e) = server.destroy().await {
            warn!("failed to destroy mock server: {}", e);
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
