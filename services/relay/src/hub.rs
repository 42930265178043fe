//! WebSocket hub: client registry, broadcast fan-out, slow-client eviction.
//!
//! The hub task owns the client set; registration, unregistration and
//! broadcasts all arrive over one command channel, so the set is only ever
//! touched from the hub loop.  Each client gets a bounded send buffer;
//! broadcasts use a non-blocking send and a full buffer evicts the client
//! (its sender is dropped, which makes the write pump emit a Close frame
//! and exit).  Other clients are unaffected.
//!
//! Per client two pumps run: the write pump drains the send buffer
//! (coalescing any backlog into a single text frame, newline-separated) and
//! pings on an interval; the read pump watches for pong/close traffic under
//! a read deadline.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Frames buffered per client before it is considered too slow.
pub const CLIENT_BUFFER: usize = 256;
/// Commands buffered for the hub loop itself.
const HUB_QUEUE: usize = 1024;
/// A client must show read activity (typically a pong) within this window.
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping interval; must be shorter than `PONG_WAIT`.
const PING_PERIOD: Duration = Duration::from_secs(54);

enum HubCommand {
    Register {
        client_id: u64,
        addr: String,
        sender: mpsc::Sender<String>,
    },
    Unregister {
        client_id: u64,
    },
    Broadcast {
        frame: String,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle used by the broadcast handler and the WS route.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Enqueue a frame for every connected client.  Fire-and-forget: after
    /// hub shutdown this is a no-op.
    pub async fn broadcast(&self, frame: String) {
        let _ = self.tx.send(HubCommand::Broadcast { frame }).await;
    }

    fn next_client_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register(&self, client_id: u64, addr: String, sender: mpsc::Sender<String>) {
        let _ = self
            .tx
            .send(HubCommand::Register {
                client_id,
                addr,
                sender,
            })
            .await;
    }

    async fn unregister(&self, client_id: u64) {
        let _ = self.tx.send(HubCommand::Unregister { client_id }).await;
    }
}

// ---------------------------------------------------------------------------
// Hub task
// ---------------------------------------------------------------------------

struct ClientEntry {
    addr: String,
    sender: mpsc::Sender<String>,
}

pub struct Hub {
    rx: mpsc::Receiver<HubCommand>,
    shutdown: watch::Receiver<bool>,
    clients: HashMap<u64, ClientEntry>,
}

/// Create a hub and its handle.  Spawn `hub.run()` once at startup.
pub fn channel(shutdown: watch::Receiver<bool>) -> (HubHandle, Hub) {
    let (tx, rx) = mpsc::channel(HUB_QUEUE);
    (
        HubHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        Hub {
            rx,
            shutdown,
            clients: HashMap::new(),
        },
    )
}

impl Hub {
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                cmd = self.rx.recv() => match cmd {
                    None => break,
                    Some(HubCommand::Register { client_id, addr, sender }) => {
                        self.clients.insert(client_id, ClientEntry { addr: addr.clone(), sender });
                        info!(client_id, addr = %addr, clients = self.clients.len(), "ws client registered");
                    }
                    Some(HubCommand::Unregister { client_id }) => {
                        if self.clients.remove(&client_id).is_some() {
                            debug!(client_id, clients = self.clients.len(), "ws client unregistered");
                        }
                    }
                    Some(HubCommand::Broadcast { frame }) => self.broadcast(frame),
                },
            }
        }
        // Dropping the senders closes every client's buffer; the write pumps
        // send Close frames and exit.
        self.clients.clear();
        info!("hub stopped");
    }

    fn broadcast(&mut self, frame: String) {
        let mut evicted = Vec::new();
        for (client_id, client) in &self.clients {
            match client.sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client_id, addr = %client.addr, "send buffer full, dropping slow ws client");
                    evicted.push(*client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(*client_id),
            }
        }
        for client_id in evicted {
            self.clients.remove(&client_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Per-client session
// ---------------------------------------------------------------------------

/// Drive one WebSocket client from upgrade to disconnect.
///
/// `history` frames are pushed straight into this client's own buffer before
/// it is registered with the hub, so the snapshot always lands ahead of any
/// concurrent live broadcast.
pub async fn client_session(socket: WebSocket, addr: String, hub: HubHandle, history: Vec<String>) {
    let (sender, receiver) = mpsc::channel::<String>(CLIENT_BUFFER);
    let client_id = hub.next_client_id();
    let (sink, stream) = socket.split();

    // The write pump must already be draining while history is replayed: the
    // replay may exceed the buffer capacity.
    let write_task = tokio::spawn(write_pump(sink, receiver));
    for frame in history {
        if sender.send(frame).await.is_err() {
            return;
        }
    }
    hub.register(client_id, addr, sender).await;

    read_pump(stream).await;
    hub.unregister(client_id).await;
    let _ = write_task.await;
}

/// Drain the send buffer into the socket, coalescing any backlog into one
/// newline-separated text frame, and ping on an interval.  Channel close
/// (unregister, eviction, or hub shutdown) sends a Close frame and exits.
async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<String>) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(first) => {
                    let mut out = first;
                    while let Ok(next) = rx.try_recv() {
                        out.push('\n');
                        out.push_str(&next);
                    }
                    if sink.send(Message::Text(out.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Watch the socket for liveness.  Any inbound frame counts; a quiet socket
/// past the pong deadline, a close frame, or a read error ends the session.
async fn read_pump(mut stream: SplitStream<WebSocket>) {
    loop {
        match tokio::time::timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                debug!("ws read deadline expired");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(200);

    async fn recv(rx: &mut mpsc::Receiver<String>) -> Option<String> {
        timeout(TICK, rx.recv()).await.expect("receive within deadline")
    }

    #[tokio::test]
    async fn broadcast_reaches_all_registered_clients() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, hub) = channel(shutdown_rx);
        tokio::spawn(hub.run());

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        handle.register(1, "a".to_owned(), tx_a).await;
        handle.register(2, "b".to_owned(), tx_b).await;

        handle.broadcast("hello".to_owned()).await;
        assert_eq!(recv(&mut rx_a).await.as_deref(), Some("hello"));
        assert_eq!(recv(&mut rx_b).await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn slow_client_is_evicted_and_others_continue() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, hub) = channel(shutdown_rx);
        tokio::spawn(hub.run());

        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = mpsc::channel(64);
        handle.register(1, "slow".to_owned(), tx_slow).await;
        handle.register(2, "ok".to_owned(), tx_ok).await;

        // First frame fills the slow client's buffer; the second overflows
        // it and evicts the client.
        handle.broadcast("one".to_owned()).await;
        handle.broadcast("two".to_owned()).await;
        handle.broadcast("three".to_owned()).await;

        assert_eq!(recv(&mut rx_ok).await.as_deref(), Some("one"));
        assert_eq!(recv(&mut rx_ok).await.as_deref(), Some("two"));
        assert_eq!(recv(&mut rx_ok).await.as_deref(), Some("three"));

        // The evicted client got the buffered frame, then its channel closed.
        assert_eq!(recv(&mut rx_slow).await.as_deref(), Some("one"));
        assert_eq!(recv(&mut rx_slow).await, None);
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, hub) = channel(shutdown_rx);
        tokio::spawn(hub.run());

        let (tx, mut rx) = mpsc::channel(8);
        handle.register(1, "a".to_owned(), tx).await;
        handle.broadcast("before".to_owned()).await;
        assert_eq!(recv(&mut rx).await.as_deref(), Some("before"));

        handle.unregister(1).await;
        handle.broadcast("after".to_owned()).await;
        assert_eq!(recv(&mut rx).await, None);
    }

    #[tokio::test]
    async fn shutdown_closes_client_channels() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, hub) = channel(shutdown_rx);
        let hub_task = tokio::spawn(hub.run());

        let (tx, mut rx) = mpsc::channel(8);
        handle.register(1, "a".to_owned(), tx).await;

        shutdown_tx.send(true).expect("hub is subscribed");
        timeout(TICK, hub_task).await.expect("hub exits").unwrap();
        assert_eq!(recv(&mut rx).await, None);
    }

    #[tokio::test]
    async fn client_ids_are_unique() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _hub) = channel(shutdown_rx);
        let a = handle.next_client_id();
        let b = handle.next_client_id();
        assert_ne!(a, b);
    }
}
