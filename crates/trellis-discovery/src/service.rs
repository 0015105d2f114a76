//! The discovery listener and prober.
//!
//! One UDP socket per node does both jobs: the listener task answers probes
//! and records announcements, and [`Discovery::discover_nodes`] sends probes
//! from the same socket so answers come back to the listener.
//!
//! ## Quorum
//!
//! After every attempt, in this order:
//!
//! 1. a master that is the only master in the roster records itself and
//!    succeeds without waiting for anyone;
//! 2. once `min_bootstrap_nodes` peers have announced themselves, succeed;
//! 3. on the last attempt, a master that has discovered nobody but has
//!    answered at least one probe records itself and succeeds;
//! 4. on the last attempt, fail with found versus required.
//!
//! Waiting for a real quorum always wins over the sole-master fallback.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::roster::Roster;
use crate::wire::Frame;
use crate::{DiscoveryError, Result, DISCOVERY_INTERVAL_MS, DISCOVERY_RETRIES, MIN_BOOTSTRAP_NODES};

/// Frames are a few dozen bytes; anything larger is not ours.
const MAX_FRAME_SIZE: usize = 2048;

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Shared network secret. Frames carrying anything else are ignored.
    pub pepper: Vec<u8>,
    /// Number of probe attempts before giving up.
    pub retries: u32,
    /// How long each attempt waits for announcements.
    pub interval: Duration,
    pub min_bootstrap_nodes: usize,
    /// Discovery addresses to probe. When empty, the /24 around the start
    /// address is scanned instead.
    pub bootnodes: Vec<SocketAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            pepper: Vec::new(),
            retries: DISCOVERY_RETRIES,
            interval: Duration::from_millis(DISCOVERY_INTERVAL_MS),
            min_bootstrap_nodes: MIN_BOOTSTRAP_NODES,
            bootnodes: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pepper.is_empty() {
            return Err(DiscoveryError::InvalidConfig("pepper is not set".to_string()));
        }
        if self.retries == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "retries must be at least 1".to_string(),
            ));
        }
        if self.min_bootstrap_nodes == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "min_bootstrap_nodes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a [`Discovery::discover_nodes`] run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Bootstrapped alone; the local node was recorded as discovered.
    SoleMaster { attempts: u32 },
    /// Enough peers announced themselves.
    Quorum { attempts: u32, found: usize },
    /// Retries exhausted without a quorum.
    Insufficient {
        attempts: u32,
        found: usize,
        required: usize,
    },
}

impl DiscoveryOutcome {
    pub fn success(&self) -> bool {
        !matches!(self, Self::Insufficient { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::SoleMaster { attempts }
            | Self::Quorum { attempts, .. }
            | Self::Insufficient { attempts, .. } => *attempts,
        }
    }
}

/// Bookkeeping for an address this node has probed.
#[derive(Clone, Copy, Debug)]
pub struct Connection {
    pub first_probe: Instant,
    pub probes: u32,
}

#[derive(Debug, Default)]
struct DiscoveryState {
    discovered_nodes: HashMap<[u8; 32], SocketAddr>,
    connections: HashMap<SocketAddr, Connection>,
    is_listen_ready: bool,
    is_connected: bool,
}

/// State shared between the listener task and the prober.
struct Shared {
    state: Mutex<DiscoveryState>,
    /// Number of discovered nodes, published after every change.
    discovered: watch::Sender<usize>,
}

impl Shared {
    async fn record(&self, verifying_key: [u8; 32], addr: SocketAddr) {
        let count = {
            let mut state = self.state.lock().await;
            state.discovered_nodes.insert(verifying_key, addr);
            state.is_listen_ready = true;
            state.discovered_nodes.len()
        };
        self.discovered.send_replace(count);
    }
}

/// A running discovery endpoint.
pub struct Discovery {
    config: DiscoveryConfig,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    verifying_key: [u8; 32],
    is_master: bool,
    only_master: bool,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// Bind the discovery socket at `addr` and start listening.
    ///
    /// The bound address is what this node advertises, so `addr` should be
    /// the host address peers can reach, not a wildcard.
    pub async fn bind(
        config: DiscoveryConfig,
        addr: SocketAddr,
        verifying_key: [u8; 32],
        roster: &Roster,
    ) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(config, socket, verifying_key, roster)
    }

    /// Start listening on an already bound socket.
    pub fn from_socket(
        config: DiscoveryConfig,
        socket: UdpSocket,
        verifying_key: [u8; 32],
        roster: &Roster,
    ) -> Result<Self> {
        config.validate()?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;
        let is_master = roster.is_master(&verifying_key);
        let only_master = is_master && roster.masters().len() == 1;

        let (discovered, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(DiscoveryState {
                is_listen_ready: is_master,
                ..DiscoveryState::default()
            }),
            discovered,
        });
        let cancel = CancellationToken::new();

        let listener = tokio::spawn(listen(
            Responder {
                socket: Arc::clone(&socket),
                shared: Arc::clone(&shared),
                local_addr,
                verifying_key,
                pepper: config.pepper.clone(),
            },
            cancel.clone(),
        ));

        info!(
            addr = %local_addr,
            key = %hex::encode(&verifying_key[..4]),
            master = is_master,
            "Listening for discovery probes"
        );

        Ok(Self {
            config,
            socket,
            local_addr,
            verifying_key,
            is_master,
            only_master,
            shared,
            cancel,
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn verifying_key(&self) -> &[u8; 32] {
        &self.verifying_key
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Every `{verifying_key -> address}` learned so far.
    pub async fn discovered_nodes(&self) -> HashMap<[u8; 32], SocketAddr> {
        self.shared.state.lock().await.discovered_nodes.clone()
    }

    pub async fn connections(&self) -> HashMap<SocketAddr, Connection> {
        self.shared.state.lock().await.connections.clone()
    }

    /// Whether this node answers probes.
    pub async fn is_listen_ready(&self) -> bool {
        self.shared.state.lock().await.is_listen_ready
    }

    /// Whether this node has answered at least one probe.
    pub async fn is_connected(&self) -> bool {
        self.shared.state.lock().await.is_connected
    }

    /// Host addresses of the /24 around `start` at this node's discovery
    /// port, without the local address.
    pub fn ip_range(&self, start: IpAddr) -> Vec<SocketAddr> {
        ip_range(start, self.local_addr.port())
            .into_iter()
            .filter(|addr| *addr != self.local_addr)
            .collect()
    }

    /// Probe the bootnodes (or the range around `start`) until a quorum is
    /// reached or the retries run out.
    pub async fn discover_nodes(&self, start: IpAddr) -> DiscoveryOutcome {
        let targets = if self.config.bootnodes.is_empty() {
            info!(start = %start, "Probing address range");
            self.ip_range(start)
        } else {
            info!(bootnodes = ?self.config.bootnodes, "Probing bootnodes");
            self.config.bootnodes.clone()
        };
        let required = self.config.min_bootstrap_nodes;
        let mut attempts = 0;

        loop {
            attempts += 1;
            self.probe_all(&targets).await;

            if self.only_master {
                self.shared.record(self.verifying_key, self.local_addr).await;
                info!(attempts, "Bootstrapping as the only master");
                return DiscoveryOutcome::SoleMaster { attempts };
            }

            let found = self.await_quorum(required).await;
            if found >= required {
                info!(attempts, found, "Found enough nodes to bootstrap");
                return DiscoveryOutcome::Quorum { attempts, found };
            }

            if attempts >= self.config.retries || self.cancel.is_cancelled() {
                let (empty, connected) = {
                    let state = self.shared.state.lock().await;
                    (state.discovered_nodes.is_empty(), state.is_connected)
                };
                if self.is_master && empty && connected {
                    self.shared.record(self.verifying_key, self.local_addr).await;
                    info!(attempts, "Nobody announced; bootstrapping as sole master");
                    return DiscoveryOutcome::SoleMaster { attempts };
                }
                warn!(attempts, found, required, "Did not find enough nodes");
                return DiscoveryOutcome::Insufficient {
                    attempts,
                    found,
                    required,
                };
            }
            debug!(attempts, found, required, "Quorum not reached yet");
        }
    }

    /// Stop the listener and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.listener.lock().await.take() {
            let _ = handle.await;
        }
        debug!(addr = %self.local_addr, "Discovery stopped");
    }

    async fn probe_all(&self, targets: &[SocketAddr]) {
        let frame = match Frame::probe(self.local_addr, &self.config.pepper).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode discovery probe");
                return;
            }
        };

        let targets: Vec<SocketAddr> = targets
            .iter()
            .copied()
            .filter(|target| *target != self.local_addr)
            .collect();
        {
            let mut state = self.shared.state.lock().await;
            for target in &targets {
                state
                    .connections
                    .entry(*target)
                    .and_modify(|c| c.probes += 1)
                    .or_insert(Connection {
                        first_probe: Instant::now(),
                        probes: 1,
                    });
            }
        }

        for target in &targets {
            trace!(target = %target, "Sending discovery probe");
            if let Err(e) = self.socket.send_to(&frame, target).await {
                debug!(target = %target, error = %e, "Discovery probe failed");
            }
        }
    }

    /// Wait one interval for announcements, returning early once `required`
    /// nodes are known. Returns the number discovered.
    async fn await_quorum(&self, required: usize) -> usize {
        let mut updates = self.shared.discovered.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::timeout(self.config.interval, async {
                let _ = updates.wait_for(|count| *count >= required).await;
            }) => {}
        }
        self.shared.state.lock().await.discovered_nodes.len()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Every host address (`.1` to `.254`) of the /24 containing `start`, at
/// `port`. An IPv6 start address yields only itself.
pub fn ip_range(start: IpAddr, port: u16) -> Vec<SocketAddr> {
    match start {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            (1..=254u8)
                .map(|d| SocketAddr::from(([a, b, c, d], port)))
                .collect()
        }
        IpAddr::V6(_) => vec![SocketAddr::new(start, port)],
    }
}

/// The listener's half of the shared state.
struct Responder {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    verifying_key: [u8; 32],
    pepper: Vec<u8>,
}

impl Responder {
    async fn handle(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        let frame = Frame::decode(data)?;
        if frame.pepper() != self.pepper.as_slice() {
            warn!(from = %from, addr = %frame.addr(), "Discovery frame with incorrect pepper");
            return Ok(());
        }

        match frame {
            Frame::Probe { addr, .. } => {
                {
                    let mut state = self.shared.state.lock().await;
                    if !state.is_listen_ready || addr == self.local_addr {
                        trace!(from = %from, ready = state.is_listen_ready, "Not answering discovery probe");
                        return Ok(());
                    }
                    state.is_connected = true;
                }
                let reply =
                    Frame::announce(self.local_addr, &self.pepper, self.verifying_key).encode()?;
                self.socket.send_to(&reply, from).await?;
                debug!(to = %from, "Answered discovery probe");
            }
            Frame::Announce {
                addr,
                verifying_key,
                ..
            } => {
                debug!(addr = %addr, key = %hex::encode(&verifying_key[..4]), "Discovered node");
                self.shared.record(verifying_key, addr).await;
            }
        }
        Ok(())
    }
}

async fn listen(responder: Responder, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = responder.socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "Discovery socket receive failed");
                    continue;
                }
            },
        };
        if let Err(e) = responder.handle(&buf[..len], from).await {
            debug!(from = %from, error = %e, "Dropping discovery frame");
        }
    }
    debug!("Discovery listener stopped");
}
