//! The per-cell protocol engine.
//!
//! [`CellState`] is a synchronous state machine: it consumes envelopes and
//! timer events and returns the datagrams to send. [`spawn`] wraps it in a
//! single-writer actor so the receive path, the dead-neighbor sweep and the
//! differentiation timer never mutate state concurrently.

use crate::config::CellConfig;
use crate::detector::{healing_targets, FailureDetector};
use crate::error::NodeError;
use crate::guard::{self, Verdict};
use crate::isolation::Blacklist;
use crate::role::{self, Role};
use crate::store::ChunkStore;
use crate::transport::UdpTransport;
use cellsync_protocol::{AlertNotice, ChunkRecord, ChunkRequest, Envelope, Message};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

const INBOUND_QUEUE: usize = 1024;

/// Bytes a sabotaged cell writes over its chunk.
fn sabotage_payload() -> Vec<u8> {
    [0xde, 0xad, 0xbe, 0xef].repeat(10)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellIdentity {
    pub id: String,
    pub port: u16,
    pub neighbors: Vec<u16>,
}

impl CellIdentity {
    pub fn new(port: u16, neighbors: Vec<u16>) -> Self {
        Self {
            id: format!("cell-{port}"),
            port,
            neighbors,
        }
    }
}

/// A datagram the state machine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Send { to: u16, message: Message },
    Broadcast { to: Vec<u16>, message: Message },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellSnapshot {
    pub id: String,
    pub port: u16,
    pub role: Role,
    pub neighbors: Vec<u16>,
    pub alive: Vec<u16>,
    pub blacklist: Vec<u16>,
    pub chunks: Vec<String>,
}

pub struct CellState {
    id: String,
    port: u16,
    neighbors: Vec<u16>,
    role: Role,
    detector: FailureDetector,
    blacklist: Blacklist,
    store: ChunkStore,
}

impl CellState {
    pub fn new(
        identity: CellIdentity,
        role: Role,
        store: ChunkStore,
        config: &CellConfig,
        now: Instant,
    ) -> Self {
        let neighbors: Vec<u16> = identity
            .neighbors
            .into_iter()
            .filter(|port| *port != identity.port)
            .collect();
        Self {
            id: identity.id,
            port: identity.port,
            detector: FailureDetector::new(&neighbors, config.dead_after(), now),
            neighbors,
            role,
            blacklist: Blacklist::new(),
            store,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn neighbors(&self) -> &[u16] {
        &self.neighbors
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn alive(&self) -> Vec<u16> {
        self.detector.alive()
    }

    /// Dispatches one inbound envelope. Anything from a quarantined port is
    /// dropped before its kind is even looked at.
    pub fn handle(&mut self, envelope: Envelope, now: Instant) -> Vec<Outbound> {
        let sender = envelope.sender_port;
        if self.blacklist.contains(sender) {
            return Vec::new();
        }

        match envelope.message {
            Message::Heartbeat => {
                if self.detector.observe(sender, now) {
                    debug!(port = self.port, peer = sender, "Neighbor is alive");
                }
                Vec::new()
            }
            Message::Store(record) => self.on_store(sender, record),
            Message::Request(request) => self.on_request(request),
            Message::Replicate => self.on_replicate(sender),
            Message::Alert(notice) => {
                self.on_alert(notice);
                Vec::new()
            }
            Message::Sabotage => self.on_sabotage(),
            Message::Unknown => Vec::new(),
        }
    }

    /// Dead-neighbor check. Each death yields exactly one REPLICATE
    /// broadcast to the neighbors still alive.
    pub fn sweep(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        for dead in self.detector.sweep(now) {
            warn!(port = self.port, peer = dead, "Detected dead neighbor");
            let survivors = healing_targets(&self.detector, dead);
            info!(port = self.port, peer = dead, survivors = ?survivors, "Initiating healing");
            out.push(Outbound::Broadcast {
                to: survivors,
                message: Message::Replicate,
            });
        }
        out
    }

    pub fn differentiate(&mut self) -> Option<Role> {
        let assigned = role::differentiate(&mut self.role, self.port, &self.neighbors)?;
        info!(port = self.port, role = %assigned, "Cell differentiated");
        Some(assigned)
    }

    pub fn heartbeat(&self) -> Outbound {
        Outbound::Broadcast {
            to: self.neighbors.clone(),
            message: Message::Heartbeat,
        }
    }

    pub fn snapshot(&self) -> CellSnapshot {
        CellSnapshot {
            id: self.id.clone(),
            port: self.port,
            role: self.role,
            neighbors: self.neighbors.clone(),
            alive: self.detector.alive(),
            blacklist: self.blacklist.ports(),
            chunks: self.store.ids(),
        }
    }

    fn on_store(&mut self, sender: u16, record: ChunkRecord) -> Vec<Outbound> {
        if self.role == Role::Guard {
            if let Verdict::Reject { actual_hash, alert } = guard::inspect(&record, sender) {
                warn!(
                    port = self.port,
                    culprit = sender,
                    chunk = %record.id,
                    expected = %record.hash,
                    actual = %actual_hash,
                    "Corruption detected, rejecting chunk"
                );
                return vec![Outbound::Broadcast {
                    to: self.detector.alive(),
                    message: Message::Alert(alert),
                }];
            }
        }

        let chunk_id = record.id.clone();
        if let Err(e) = self.store.put(record) {
            warn!(port = self.port, chunk = %chunk_id, error = %e, "Failed to persist chunk");
        }
        Vec::new()
    }

    fn on_request(&self, request: ChunkRequest) -> Vec<Outbound> {
        match self.store.get(&request.chunk_id) {
            Some(record) => vec![Outbound::Send {
                to: request.requestor_port,
                message: Message::Store(record.clone()),
            }],
            None => {
                debug!(port = self.port, chunk = %request.chunk_id, "Requested chunk not held");
                Vec::new()
            }
        }
    }

    // Full flood: every held chunk goes back, not just the ones the
    // requester is missing.
    fn on_replicate(&self, sender: u16) -> Vec<Outbound> {
        debug!(port = self.port, peer = sender, chunks = self.store.len(), "Replicating inventory");
        self.store
            .all_metadata()
            .into_iter()
            .map(|record| Outbound::Send {
                to: sender,
                message: Message::Store(record),
            })
            .collect()
    }

    fn on_alert(&mut self, notice: AlertNotice) {
        if notice.culprit == self.port {
            debug!(port = self.port, chunk = %notice.chunk, "Ignoring alert naming this cell");
            return;
        }
        if self.blacklist.quarantine(notice.culprit) {
            warn!(
                port = self.port,
                culprit = notice.culprit,
                chunk = %notice.chunk,
                "Isolating cell after corruption alert"
            );
        }
    }

    fn on_sabotage(&mut self) -> Vec<Outbound> {
        info!(port = self.port, "Installing firmware update");
        let Some(corrupted) = self.store.corrupt_first(sabotage_payload()) else {
            info!(port = self.port, "Update applied, no chunks to corrupt");
            return Vec::new();
        };
        warn!(
            port = self.port,
            chunk = %corrupted.id,
            "Update corrupted local chunk, broadcasting it"
        );
        vec![Outbound::Broadcast {
            to: self.detector.alive(),
            message: Message::Store(corrupted),
        }]
    }
}

enum Command {
    Snapshot(oneshot::Sender<CellSnapshot>),
}

/// Owner-side view of a running cell.
pub struct CellHandle {
    port: u16,
    commands: mpsc::Sender<Command>,
    shutdown: Option<oneshot::Sender<()>>,
    transport: Arc<UdpTransport>,
    actor: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl CellHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn snapshot(&self) -> Result<CellSnapshot, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(reply))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Stops every loop, closes the transport and waits for the tasks.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.transport.close();
        if let Err(e) = (&mut self.actor).await {
            warn!(port = self.port, error = %e, "Cell task ended abnormally");
        }
        if let Err(e) = (&mut self.receiver).await {
            warn!(port = self.port, error = %e, "Receive task ended abnormally");
        }
        info!(port = self.port, "Cell stopped");
    }
}

/// Binds the cell's port and starts it. Failing to bind is fatal.
pub async fn spawn(
    identity: CellIdentity,
    role: Role,
    config: CellConfig,
) -> Result<CellHandle, NodeError> {
    let transport = UdpTransport::bind(config.host, identity.port, config.max_datagram).await?;
    spawn_with_transport(identity, role, config, transport)
}

/// Starts a cell on an already bound transport; the transport's port wins
/// over `identity.port`.
pub fn spawn_with_transport(
    mut identity: CellIdentity,
    role: Role,
    config: CellConfig,
    transport: UdpTransport,
) -> Result<CellHandle, NodeError> {
    identity.port = transport.port();
    let store = ChunkStore::open(config.storage_dir(identity.port))?;
    let state = CellState::new(identity, role, store, &config, Instant::now());
    info!(
        port = state.port(),
        role = %state.role(),
        neighbors = ?state.neighbors(),
        chunks = state.store().len(),
        "Cell started"
    );

    let port = state.port();
    let transport = Arc::new(transport);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let receiver = tokio::spawn(receive_loop(Arc::clone(&transport), inbound_tx));
    let actor = tokio::spawn(run(
        state,
        Arc::clone(&transport),
        config,
        inbound_rx,
        commands_rx,
        shutdown_rx,
    ));

    Ok(CellHandle {
        port,
        commands: commands_tx,
        shutdown: Some(shutdown_tx),
        transport,
        actor,
        receiver,
    })
}

async fn receive_loop(transport: Arc<UdpTransport>, inbound: mpsc::Sender<Envelope>) {
    while !transport.is_closed() {
        let Some((envelope, _origin)) = transport.receive().await else {
            continue;
        };
        if inbound.send(envelope).await.is_err() {
            break;
        }
    }
}

async fn run(
    mut state: CellState,
    transport: Arc<UdpTransport>,
    config: CellConfig,
    mut inbound: mpsc::Receiver<Envelope>,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let started = time::Instant::now();
    let mut heartbeat = time::interval(config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dead_check = time::interval_at(
        started + config.dead_check_interval(),
        config.dead_check_interval(),
    );
    dead_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let differentiation = time::sleep(config.differentiate_after());
    tokio::pin!(differentiation);
    let mut differentiated = state.role() != Role::Stem;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!(port = state.port(), "Shutdown signal received");
                break;
            }
            Some(command) = commands.recv() => match command {
                Command::Snapshot(reply) => {
                    let _ = reply.send(state.snapshot());
                }
            },
            envelope = inbound.recv() => {
                let Some(envelope) = envelope else { break };
                let out = state.handle(envelope, Instant::now());
                deliver(&transport, out).await;
            }
            _ = heartbeat.tick() => {
                deliver(&transport, vec![state.heartbeat()]).await;
            }
            _ = dead_check.tick() => {
                let out = state.sweep(Instant::now());
                deliver(&transport, out).await;
            }
            _ = &mut differentiation, if !differentiated => {
                differentiated = true;
                state.differentiate();
            }
        }
    }
    transport.close();
}

async fn deliver(transport: &UdpTransport, out: Vec<Outbound>) {
    for outbound in out {
        match outbound {
            Outbound::Send { to, message } => transport.send(to, &message).await,
            Outbound::Broadcast { to, message } => transport.broadcast(&to, &message).await,
        }
    }
}
