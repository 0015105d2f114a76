//! Request/reply RPC for the DHT.
//!
//! [`DhtTransport`] is the seam between the DHT logic and the network: the
//! crawl, the bootstrap and the network manager only ever call `ping` and
//! `find_node` through it. [`UdpRpc`] is the real implementation.
//!
//! ## Correlation
//!
//! Every outgoing request gets a fresh random `msg_id` and a [`PendingRpc`]
//! entry. The receive loop hands a reply to its caller only if the id is
//! pending, the datagram came from the address the request went to, and the
//! reply type answers the request method. Anything else is dropped. A request
//! that times out resolves to `None`, never to an error.
//!
//! Inbound requests are not answered here: they are queued for whoever owns
//! the routing table (see `Network::spawn_listener`).

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use trellis_transport::messages::{FindNode, Ping, TypedMessage};
use trellis_transport::wire::{ProtocolMessage, MAX_DATAGRAM_SIZE};

use crate::kademlia::{NodeId, NodeInfo};
use crate::Result;

/// Depth of the inbound request queue.
const REQUEST_QUEUE_DEPTH: usize = 256;

/// Network operations the DHT needs from its transport.
///
/// Failures (timeouts, malformed or foreign replies, socket errors) surface as
/// `false` / `None` so callers can treat the peer as unreachable and move on.
pub trait DhtTransport: Send + Sync + 'static {
    /// Check whether `node` is alive.
    fn ping(&self, node: &NodeInfo) -> impl Future<Output = bool> + Send;

    /// Ask `node` for the nodes it knows closest to `target`.
    fn find_node(
        &self,
        node: &NodeInfo,
        target: NodeId,
    ) -> impl Future<Output = Option<Vec<NodeInfo>>> + Send;

    /// Ping a bare address and learn who answers.
    fn probe(&self, addr: SocketAddr) -> impl Future<Output = Option<NodeInfo>> + Send;

    /// Release sockets and background tasks.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// The remote operation a pending request is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcMethod {
    Ping,
    FindNode,
}

impl RpcMethod {
    /// Whether `reply` is a valid answer to this method.
    pub fn accepts(&self, reply: &TypedMessage) -> bool {
        matches!(
            (self, reply),
            (Self::Ping, TypedMessage::Pong(_)) | (Self::FindNode, TypedMessage::FindNodeResponse(_))
        )
    }
}

/// A request waiting for its reply.
#[derive(Debug)]
pub struct PendingRpc {
    pub target: SocketAddr,
    pub method: RpcMethod,
    pub issued_at: Instant,
    pub timeout: Duration,
    reply: oneshot::Sender<TypedMessage>,
}

/// Outstanding requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingRpcs {
    entries: HashMap<[u8; 16], PendingRpc>,
}

impl PendingRpcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. The returned receiver yields the matching reply.
    pub fn register(
        &mut self,
        msg_id: [u8; 16],
        target: SocketAddr,
        method: RpcMethod,
        timeout: Duration,
    ) -> oneshot::Receiver<TypedMessage> {
        let (reply, rx) = oneshot::channel();
        self.entries.insert(
            msg_id,
            PendingRpc {
                target,
                method,
                issued_at: Instant::now(),
                timeout,
                reply,
            },
        );
        rx
    }

    /// Deliver `reply` to the request it answers.
    ///
    /// Returns `false` without touching the pending entry if the id is unknown,
    /// the sender is not the request target, or the reply type is wrong.
    pub fn resolve(&mut self, msg_id: &[u8; 16], from: SocketAddr, reply: TypedMessage) -> bool {
        let matches = self
            .entries
            .get(msg_id)
            .is_some_and(|rpc| rpc.target == from && rpc.method.accepts(&reply));
        if !matches {
            return false;
        }
        let Some(rpc) = self.entries.remove(msg_id) else {
            return false;
        };
        trace!(
            from = %from,
            method = ?rpc.method,
            elapsed_ms = rpc.issued_at.elapsed().as_millis() as u64,
            "RPC reply matched"
        );
        // The caller may have given up already.
        let _ = rpc.reply.send(reply);
        true
    }

    pub fn remove(&mut self, msg_id: &[u8; 16]) -> Option<PendingRpc> {
        self.entries.remove(msg_id)
    }

    /// Drop entries whose deadline has passed. Returns how many were dropped.
    pub fn expire(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, rpc| rpc.issued_at.elapsed() < rpc.timeout);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A request from a peer, queued for the routing-table owner to answer.
#[derive(Clone, Debug)]
pub struct InboundRequest {
    pub envelope: ProtocolMessage,
    pub message: TypedMessage,
    pub requester: NodeInfo,
    pub from: SocketAddr,
}

/// DHT RPC node over a single UDP socket.
///
/// Binding spawns a receive loop that resolves pending requests, so outgoing
/// calls work as soon as [`UdpRpc::bind`] returns.
pub struct UdpRpc {
    socket: Arc<UdpSocket>,
    local: NodeInfo,
    timeout: Duration,
    pending: Arc<Mutex<PendingRpcs>>,
    requests: Mutex<Option<mpsc::Receiver<InboundRequest>>>,
    cancel: CancellationToken,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpRpc {
    /// Bind the DHT socket and start receiving.
    ///
    /// The local node is advertised at the socket's bound address.
    pub async fn bind(addr: SocketAddr, verifying_key: [u8; 32], timeout: Duration) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = NodeInfo::new(verifying_key, socket.local_addr()?);
        let pending = Arc::new(Mutex::new(PendingRpcs::new()));
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let cancel = CancellationToken::new();

        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&pending),
            tx,
            cancel.clone(),
        ));

        debug!(addr = %local.addr, node_id = %local.node_id, "DHT RPC socket bound");

        Ok(Self {
            socket,
            local,
            timeout,
            pending,
            requests: Mutex::new(Some(rx)),
            cancel,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn local_node(&self) -> &NodeInfo {
        &self.local
    }

    /// Take the inbound request queue. Only the first caller gets it.
    pub async fn take_requests(&self) -> Option<mpsc::Receiver<InboundRequest>> {
        self.requests.lock().await.take()
    }

    /// Send `reply` to the peer that issued `request`, echoing its id.
    pub async fn respond(&self, request: &InboundRequest, reply: &TypedMessage) -> Result<()> {
        let envelope = ProtocolMessage::reply_to(&request.envelope, reply)?;
        self.socket
            .send_to(&envelope.to_bytes()?, request.from)
            .await?;
        Ok(())
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn call(
        &self,
        target: SocketAddr,
        method: RpcMethod,
        message: TypedMessage,
    ) -> Option<TypedMessage> {
        let request = match ProtocolMessage::from_typed(&message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Failed to build DHT request");
                return None;
            }
        };
        let bytes = match request.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode DHT request");
                return None;
            }
        };

        let rx = self
            .pending
            .lock()
            .await
            .register(request.msg_id, target, method, self.timeout);

        if let Err(e) = self.socket.send_to(&bytes, target).await {
            debug!(target = %target, error = %e, "DHT send failed");
            self.pending.lock().await.remove(&request.msg_id);
            return None;
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => None,
            Err(_) => {
                self.pending.lock().await.remove(&request.msg_id);
                debug!(target = %target, method = ?method, "DHT request timed out");
                None
            }
        }
    }
}

impl DhtTransport for UdpRpc {
    async fn ping(&self, node: &NodeInfo) -> bool {
        let ping = TypedMessage::Ping(Ping {
            sender: self.local.descriptor(),
        });
        matches!(
            self.call(node.addr, RpcMethod::Ping, ping).await,
            Some(TypedMessage::Pong(pong)) if pong.sender.verifying_key == node.verifying_key
        )
    }

    async fn find_node(&self, node: &NodeInfo, target: NodeId) -> Option<Vec<NodeInfo>> {
        let request = TypedMessage::FindNode(FindNode {
            sender: self.local.descriptor(),
            target: target.0,
        });
        let Some(TypedMessage::FindNodeResponse(response)) =
            self.call(node.addr, RpcMethod::FindNode, request).await
        else {
            return None;
        };
        if response.sender.verifying_key != node.verifying_key {
            warn!(addr = %node.addr, "FIND_NODE answered by a different key");
            return None;
        }
        let nodes = response
            .nodes
            .iter()
            .filter_map(|descriptor| match NodeInfo::try_from(descriptor) {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!(from = %node.addr, error = %e, "Skipping invalid node descriptor");
                    None
                }
            })
            .collect();
        Some(nodes)
    }

    async fn probe(&self, addr: SocketAddr) -> Option<NodeInfo> {
        let ping = TypedMessage::Ping(Ping {
            sender: self.local.descriptor(),
        });
        match self.call(addr, RpcMethod::Ping, ping).await {
            Some(TypedMessage::Pong(pong)) => NodeInfo::try_from(&pong.sender).ok(),
            _ => None,
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.receiver.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for UdpRpc {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    pending: Arc<Mutex<PendingRpcs>>,
    requests: mpsc::Sender<InboundRequest>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "DHT socket receive failed");
                    continue;
                }
            },
        };
        dispatch(&buf[..len], from, &pending, &requests).await;
    }
    debug!("DHT receive loop stopped");
}

async fn dispatch(
    data: &[u8],
    from: SocketAddr,
    pending: &Mutex<PendingRpcs>,
    requests: &mpsc::Sender<InboundRequest>,
) {
    let envelope = match ProtocolMessage::from_bytes(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(from = %from, error = %e, "Dropping malformed DHT datagram");
            return;
        }
    };
    let message = match envelope.decode_payload() {
        Ok(message) => message,
        Err(e) => {
            warn!(from = %from, error = %e, "Dropping undecodable DHT payload");
            return;
        }
    };

    if message.is_response() {
        let mut pending = pending.lock().await;
        pending.expire();
        if !pending.resolve(&envelope.msg_id, from, message) {
            debug!(from = %from, "Dropping uncorrelated DHT reply");
        }
        return;
    }

    let requester = match NodeInfo::try_from(message.sender()) {
        Ok(requester) => requester,
        Err(e) => {
            warn!(from = %from, error = %e, "Dropping request with invalid sender");
            return;
        }
    };
    trace!(from = %from, msg_type = envelope.msg_type, "DHT request received");
    let request = InboundRequest {
        envelope,
        message,
        requester,
        from,
    };
    if let Err(e) = requests.try_send(request) {
        warn!(from = %from, error = %e, "Dropping DHT request, queue unavailable");
    }
}
