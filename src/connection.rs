/*!
 * @file connection.rs
 * @brief Accepted client connection handle and fault injection
 */

use crate::error::{MockError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Handle to one accepted TCP connection.
///
/// Cloneable; the server's reader task, the request queue, and test code all
/// share the same underlying connection. Writes are serialized through an
/// async mutex. `destroy()` force-closes the connection, which test code
/// uses to simulate a network partition.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    id: u64,
    peer: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl ConnectionHandle {
    /// Returns the handle plus the close signal the reader task selects on.
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
    ) -> (ConnectionHandle, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        let handle = ConnectionHandle {
            inner: Arc::new(ConnectionInner {
                id,
                peer,
                writer: Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
                close_tx,
            }),
        };
        (handle, close_rx)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Writes raw bytes to the peer. Fails with `ConnectionClosed` once the
    /// connection has been destroyed.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => {
                writer.write_all(bytes).await?;
                writer.flush().await?;
                Ok(())
            }
            None => Err(MockError::ConnectionClosed),
        }
    }

    /// Force-closes the connection: shuts down the write half and signals
    /// the reader task to drop the read half. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.close_tx.send(true);
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!(id = self.inner.id, peer = %self.inner.peer, "connection destroyed");
    }
}
