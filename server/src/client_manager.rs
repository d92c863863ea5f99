//! Connected clients and their match subscriptions
//!
//! Each client subscribes to at most one match. The manager remembers the
//! last tick sent to every client so the network layer can decide between a
//! delta and a full snapshot.

use crate::snapshot::Snapshot;
use log::info;
use shared::{MatchId, PlayerId, Tick};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Silence after which a client is dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// What part of its match a client is streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Every published entity.
    #[default]
    Match,
    /// Only entities whose `OWNER_ID` is the client's own id.
    Owned,
}

/// A connected client and what it has been sent
///
/// Each client tracks:
/// - Connection metadata (ID, address, last activity)
/// - Its subscription and the scope of that subscription
/// - The tick of the last update it was handed, which decides whether the
///   next one can be a delta
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier, also the player id its commands run as
    pub id: PlayerId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Match the client follows
    pub subscription: Option<MatchId>,
    pub scope: Scope,
    /// Tick of the last snapshot or delta sent; `None` forces a full snapshot.
    pub last_sent_tick: Option<Tick>,
    /// Last owned view sent to a [`Scope::Owned`] client, the base of its
    /// next delta.
    pub last_view: Option<Arc<Snapshot>>,
}

impl Client {
    /// Creates a client with the given ID and network address
    ///
    /// The client starts unsubscribed and is marked as recently active.
    pub fn new(id: PlayerId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            subscription: None,
            scope: Scope::Match,
            last_sent_tick: None,
            last_view: None,
        }
    }

    /// Checks if the client has exceeded the connection timeout
    ///
    /// Returns true if no packets have been received from this client
    /// within `timeout`, indicating a likely disconnect.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    fn forget_sent(&mut self) {
        self.last_sent_tick = None;
        self.last_view = None;
    }
}

/// Everything the network layer needs to send one subscriber an update.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscriber {
    pub id: PlayerId,
    pub addr: SocketAddr,
    pub scope: Scope,
    pub last_sent_tick: Option<Tick>,
    pub last_view: Option<Arc<Snapshot>>,
}

/// Manages all connected clients and their subscriptions
///
/// The ClientManager enforces the server's capacity limit, hands out client
/// ids and keeps, per client, enough delivery state to choose between a
/// delta and a full snapshot.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<PlayerId, Client>,
    /// Next available client ID for new connections
    next_client_id: PlayerId,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a client manager with the specified capacity limit
    ///
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Registers a client, or returns `None` when the server is full.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<PlayerId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));
        Some(client_id)
    }

    /// Removes a client and returns it so its subscription can be released.
    pub fn remove_client(&mut self, client_id: PlayerId) -> Option<Client> {
        let client = self.clients.remove(&client_id)?;
        info!("Client {} disconnected", client.id);
        Some(client)
    }

    /// Finds the client connected from `addr`.
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<PlayerId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, client_id: PlayerId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    /// Records activity so the client does not time out.
    pub fn touch(&mut self, client_id: PlayerId) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_seen = Instant::now();
        }
    }

    /// Switches the client to `match_id` and returns the match it left.
    ///
    /// Whatever was sent before is forgotten, so the next update is a full
    /// snapshot.
    pub fn subscribe(
        &mut self,
        client_id: PlayerId,
        match_id: MatchId,
        scope: Scope,
    ) -> Option<MatchId> {
        let client = self.clients.get_mut(&client_id)?;
        client.forget_sent();
        client.scope = scope;
        client.subscription.replace(match_id)
    }

    /// Forces the next update for this client to be a full snapshot.
    pub fn resync(&mut self, client_id: PlayerId) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.forget_sent();
        }
    }

    /// Records that the update for `tick` was handed to the socket.
    pub fn mark_sent(&mut self, client_id: PlayerId, tick: Tick) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_sent_tick = Some(tick);
        }
    }

    /// Records an owned view handed to the socket; it becomes the base of
    /// the client's next delta.
    pub fn mark_view_sent(&mut self, client_id: PlayerId, view: Arc<Snapshot>) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_sent_tick = Some(view.tick);
            client.last_view = Some(view);
        }
    }

    /// Delivery state of every client subscribed to `match_id`.
    pub fn subscribers(&self, match_id: MatchId) -> Vec<Subscriber> {
        self.clients
            .values()
            .filter(|client| client.subscription == Some(match_id))
            .map(|client| Subscriber {
                id: client.id,
                addr: client.addr,
                scope: client.scope,
                last_sent_tick: client.last_sent_tick,
                last_view: client.last_view.clone(),
            })
            .collect()
    }

    /// Removes and returns clients that have been silent for too long.
    pub fn check_timeouts(&mut self) -> Vec<Client> {
        let timed_out: Vec<PlayerId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(CLIENT_TIMEOUT))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| self.remove_client(id))
            .collect()
    }

    /// Addresses of all connected clients, used for server-wide broadcasts.
    pub fn get_client_addrs(&self) -> Vec<(PlayerId, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
