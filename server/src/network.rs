//! Server network layer handling UDP communications and tick scheduling
//!
//! Socket reads, socket writes and timeout checks each run in their own task
//! and talk to the main loop over unbounded channels. The main loop owns the
//! [`Engine`] and is the only place ticks are executed.
//!
//! Outgoing packets are encoded on the main loop. A packet larger than one
//! datagram is split into fragments there, so a client is only marked as
//! having received an update once every datagram of it was queued.

use crate::client_manager::{ClientManager, Scope, Subscriber};
use crate::engine::Engine;
use crate::publish::MatchUpdate;
use crate::snapshot::{DeltaCompressor, Snapshot};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    encode_datagrams, MatchId, Packet, PlayerId, TickError, MAX_DATAGRAM, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client_id: PlayerId,
        subscription: Option<MatchId>,
    },
}

#[derive(Debug)]
pub enum GameMessage {
    /// Encoded datagrams of one packet, sent in order.
    SendDatagrams {
        datagrams: Vec<Vec<u8>>,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<PlayerId>,
    },
}

pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    engine: Engine,
    tick_duration: Duration,
    next_message_id: AtomicU32,

    updates: mpsc::UnboundedReceiver<MatchUpdate>,
    errors: broadcast::Receiver<TickError>,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        max_clients: usize,
        mut engine: Engine,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let updates = engine
            .take_updates()
            .ok_or("engine updates are already consumed")?;
        let errors = engine.subscribe_errors();

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(max_clients))),
            engine,
            tick_duration,
            next_message_id: AtomicU32::new(1),
            updates,
            errors,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; 64 * 1024];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendDatagrams { datagrams, addr } => {
                        for datagram in datagrams {
                            if let Err(e) = socket.send_to(&datagram, addr).await {
                                error!("Failed to send packet to {}: {}", addr, e);
                                break;
                            }
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }

                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client in timed_out {
                    let message = ServerMessage::ClientTimeout {
                        client_id: client.id,
                        subscription: client.subscription,
                    };
                    if let Err(e) = server_tx.send(message) {
                        error!("Failed to send timeout message: {}", e);
                        break;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        if data.len() > MAX_DATAGRAM {
            return Err(format!("packet of {} bytes does not fit a datagram", data.len()).into());
        }
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    /// Encodes `packet` and queues its datagrams for `addr`. Returns whether
    /// the whole packet was handed to the sender task.
    fn send_packet(&self, packet: Packet, addr: SocketAddr) -> bool {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let datagrams = match encode_datagrams(&packet, message_id) {
            Ok(datagrams) => datagrams,
            Err(e) => {
                error!("Failed to encode packet for {}: {}", addr, e);
                return false;
            }
        };
        if datagrams.len() > 1 {
            debug!(
                "Packet for {} split into {} fragments",
                addr,
                datagrams.len()
            );
        }

        match self.game_tx.send(GameMessage::SendDatagrams { datagrams, addr }) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to queue packet for sending: {}", e);
                false
            }
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<PlayerId>) {
        if let Err(e) = self
            .game_tx
            .send(GameMessage::BroadcastPacket { packet, exclude })
        {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    async fn client_at(&self, addr: SocketAddr) -> Option<PlayerId> {
        let mut clients = self.clients.write().await;
        let client_id = clients.find_client_by_addr(addr)?;
        clients.touch(client_id);
        Some(client_id)
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );
                if client_version != PROTOCOL_VERSION {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: format!(
                                "Protocol version {} required, got {}",
                                PROTOCOL_VERSION, client_version
                            ),
                        },
                        addr,
                    );
                    return;
                }

                // Remove existing connection if present
                let existing = {
                    let mut clients = self.clients.write().await;
                    clients
                        .find_client_by_addr(addr)
                        .and_then(|id| clients.remove_client(id))
                };
                if let Some(client) = existing {
                    info!("Replacing client {} from {}", client.id, addr);
                    if let Some(match_id) = client.subscription {
                        self.engine.hub().unwatch(match_id);
                    }
                }

                let client_id = {
                    let mut clients = self.clients.write().await;
                    clients.add_client(addr)
                };

                let response = match client_id {
                    Some(client_id) => Packet::Connected { client_id },
                    None => Packet::Disconnected {
                        reason: "Server full".to_string(),
                    },
                };
                self.send_packet(response, addr);
            }

            Packet::Subscribe { match_id } => {
                self.subscribe(addr, match_id, Scope::Match).await;
            }

            Packet::SubscribeOwned { match_id } => {
                self.subscribe(addr, match_id, Scope::Owned).await;
            }

            Packet::Resync { match_id } => {
                let Some(client_id) = self.client_at(addr).await else {
                    return;
                };
                let subscribed = {
                    let mut clients = self.clients.write().await;
                    clients.resync(client_id);
                    clients
                        .get(client_id)
                        .map_or(false, |c| c.subscription == Some(match_id))
                };
                if subscribed {
                    debug!("Client {} requested resync of {}", client_id, match_id);
                    self.send_latest(client_id, addr, match_id).await;
                }
            }

            Packet::SubmitCommands { batch_id, commands } => {
                let Some(client_id) = self.client_at(addr).await else {
                    return;
                };
                let receipt = self
                    .engine
                    .commands()
                    .submit_batch(commands, Some(client_id));
                self.send_packet(Packet::CommandReceipt { batch_id, receipt }, addr);
            }

            Packet::Heartbeat => {
                self.client_at(addr).await;
            }

            Packet::Disconnect => {
                let removed = {
                    let mut clients = self.clients.write().await;
                    clients
                        .find_client_by_addr(addr)
                        .and_then(|id| clients.remove_client(id))
                };
                if let Some(match_id) = removed.and_then(|c| c.subscription) {
                    self.engine.hub().unwatch(match_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn subscribe(&self, addr: SocketAddr, match_id: MatchId, scope: Scope) {
        let Some(client_id) = self.client_at(addr).await else {
            return;
        };
        let previous = {
            let mut clients = self.clients.write().await;
            clients.subscribe(client_id, match_id, scope)
        };

        let hub = self.engine.hub();
        if let Some(previous) = previous {
            hub.unwatch(previous);
        }
        hub.watch(match_id);
        info!(
            "Client {} subscribed to {} ({:?})",
            client_id, match_id, scope
        );
        self.send_latest(client_id, addr, match_id).await;
    }

    /// Sends the latest published snapshot of `match_id`, if there is one,
    /// narrowed to the client's scope. Otherwise the next publication reaches
    /// the client as a full snapshot.
    async fn send_latest(&self, client_id: PlayerId, addr: SocketAddr, match_id: MatchId) {
        let Some(snapshot) = self.engine.hub().latest(match_id) else {
            return;
        };
        let scope = {
            let clients = self.clients.read().await;
            match clients.get(client_id) {
                Some(client) => client.scope,
                None => return,
            }
        };

        match scope {
            Scope::Match => {
                if self.send_packet(Packet::Snapshot(snapshot.to_message()), addr) {
                    self.clients.write().await.mark_sent(client_id, snapshot.tick);
                }
            }
            Scope::Owned => {
                let view = Arc::new(snapshot.for_player(client_id));
                if self.send_packet(Packet::Snapshot(view.to_message()), addr) {
                    self.clients.write().await.mark_view_sent(client_id, view);
                }
            }
        }
    }

    /// Sends a delta to subscribers that hold its base tick and a full
    /// snapshot to everyone else. Owned-scope subscribers get a delta
    /// between their own views.
    async fn deliver_update(&self, update: MatchUpdate) {
        let subscribers = {
            let clients = self.clients.read().await;
            clients.subscribers(update.match_id)
        };
        if subscribers.is_empty() {
            return;
        }

        let tick = update.snapshot.tick;
        let mut full = None;
        let mut delivered: Vec<(PlayerId, Option<Arc<Snapshot>>)> = Vec::new();
        for subscriber in subscribers {
            let Subscriber {
                id,
                addr,
                scope,
                last_sent_tick,
                last_view,
            } = subscriber;

            let (packet, view) = match scope {
                Scope::Match => {
                    let packet = match &update.delta {
                        Some(delta) if last_sent_tick == Some(delta.base_tick) => {
                            Packet::Delta(delta.clone())
                        }
                        _ => Packet::Snapshot(
                            full.get_or_insert_with(|| update.snapshot.to_message())
                                .clone(),
                        ),
                    };
                    (packet, None)
                }
                Scope::Owned => {
                    let view = Arc::new(update.snapshot.for_player(id));
                    (owned_packet(last_view.as_deref(), &view), Some(view))
                }
            };

            debug!("Sending tick {} of {} to client {}", tick, update.match_id, id);
            if self.send_packet(packet, addr) {
                delivered.push((id, view));
            } else {
                warn!(
                    "Tick {} of {} not delivered to client {}",
                    tick, update.match_id, id
                );
            }
        }

        let mut clients = self.clients.write().await;
        for (client_id, view) in delivered {
            match view {
                Some(view) => clients.mark_view_sent(client_id, view),
                None => clients.mark_sent(client_id, tick),
            }
        }
    }

    /// Reports a failed command to its submitter, or a failed system to the
    /// match's subscribers.
    async fn deliver_error(&self, failure: TickError) {
        let recipients: Vec<SocketAddr> = {
            let clients = self.clients.read().await;
            match (failure.player_id, failure.match_id) {
                (Some(player_id), _) => clients.get(player_id).map(|c| c.addr).into_iter().collect(),
                (None, Some(match_id)) => clients
                    .subscribers(match_id)
                    .into_iter()
                    .map(|subscriber| subscriber.addr)
                    .collect(),
                (None, None) => Vec::new(),
            }
        };
        for addr in recipients {
            self.send_packet(Packet::TickError(failure.clone()), addr);
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id, subscription }) => {
                            debug!("Client {} timed out", client_id);
                            if let Some(match_id) = subscription {
                                self.engine.hub().unwatch(match_id);
                            }
                        },
                        None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let report = self.engine.tick();
                    if report.tick % 60 == 0 {
                        let client_count = self.clients.read().await.len();
                        let metrics = self.engine.tick_metrics();
                        debug!(
                            "Tick {}: {} clients, {:.2}ms avg, {} commands deferred",
                            report.tick, client_count, metrics.avg_ms, report.commands_deferred
                        );
                    }
                },

                Some(update) = self.updates.recv() => {
                    self.deliver_update(update).await;
                },

                failure = self.errors.recv() => {
                    match failure {
                        Ok(failure) => self.deliver_error(failure).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Dropped {} tick errors", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    self.broadcast_packet(
                        Packet::Disconnected {
                            reason: "Server shutting down".to_string(),
                        },
                        None,
                    );
                    // Give the sender task a moment to flush.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    break;
                },
            }
        }

        Ok(())
    }
}

/// Delta from the last owned view a client holds, or the whole view when it
/// holds none.
fn owned_packet(base: Option<&Snapshot>, view: &Snapshot) -> Packet {
    match base {
        Some(base) => Packet::Delta(DeltaCompressor::new().compute(base, view)),
        None => Packet::Snapshot(view.to_message()),
    }
}
