//! Headless UDP client following one match

use crate::mapping::DomainRegistry;
use crate::mirror::{MatchMirror, MirrorError};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::Rng;
use shared::{
    CommandPayload, CommandRequest, MatchId, Packet, PlayerId, Reassembler, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Random spread used when spawning entities.
const SPAWN_RANGE: f32 = 100.0;

/// Fragmented packets being reassembled at once; older ones are dropped.
const MAX_PENDING_MESSAGES: usize = 8;

pub struct Client<T> {
    socket: UdpSocket,
    server_addr: SocketAddr,
    client_id: Option<PlayerId>,
    connected: bool,

    match_id: MatchId,
    owned_only: bool,
    mirror: MatchMirror,
    fragments: Reassembler,
    objects: DomainRegistry<T>,

    fake_ping_ms: u64,
    spawn_count: usize,
    next_batch_id: u32,
    resyncs: u64,
}

impl<T: Default + std::fmt::Debug> Client<T> {
    pub async fn new(
        server_addr: &str,
        match_id: MatchId,
        objects: DomainRegistry<T>,
        fake_ping_ms: u64,
        spawn_count: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            client_id: None,
            connected: false,
            match_id,
            owned_only: false,
            mirror: MatchMirror::for_match(match_id),
            fragments: Reassembler::new(MAX_PENDING_MESSAGES),
            objects,
            fake_ping_ms,
            spawn_count,
            next_batch_id: 1,
            resyncs: 0,
        })
    }

    /// Follow only the entities this client owns instead of the whole match.
    pub fn with_owned_only(mut self, owned_only: bool) -> Self {
        self.owned_only = owned_only;
        self
    }

    pub fn mirror(&self) -> &MatchMirror {
        &self.mirror
    }

    pub fn objects(&self) -> &DomainRegistry<T> {
        &self.objects
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server...");
        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
        };
        self.send_packet(&packet).await
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    fn subscription(&self) -> Packet {
        if self.owned_only {
            Packet::SubscribeOwned {
                match_id: self.match_id,
            }
        } else {
            Packet::Subscribe {
                match_id: self.match_id,
            }
        }
    }

    /// Passes whole packets through and collects fragments until the packet
    /// they belong to is complete.
    fn reassemble(&mut self, packet: Packet) -> Option<Packet> {
        let Packet::Fragment {
            message_id,
            index,
            count,
            bytes,
        } = packet
        else {
            return Some(packet);
        };

        match self.fragments.push(message_id, index, count, bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping fragment: {}", e);
                None
            }
        }
    }

    /// Spawn commands placing entities of the mapped module at random
    /// positions.
    fn spawn_commands(&self) -> Vec<CommandRequest> {
        let mapping = self.objects.mapping();
        let mut rng = rand::thread_rng();

        (0..self.spawn_count)
            .map(|_| {
                let mut payload = CommandPayload::new()
                    .with("matchId", self.match_id.0 as i64)
                    .with(mapping.flag.as_str(), 1.0);
                for component in mapping.components() {
                    let value: f32 = rng.gen_range(0.0..SPAWN_RANGE);
                    payload.insert(component, f64::from(value));
                }
                CommandRequest::new("spawn", payload)
            })
            .collect()
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Box<dyn std::error::Error>> {
        match packet {
            Packet::Connected { client_id } => {
                info!("Connected! Client ID: {}", client_id);
                self.client_id = Some(client_id);
                self.connected = true;

                self.send_packet(&self.subscription()).await?;

                if self.spawn_count > 0 {
                    let batch_id = self.next_batch_id;
                    self.next_batch_id += 1;
                    let commands = self.spawn_commands();
                    info!("Submitting {} spawn commands", commands.len());
                    self.send_packet(&Packet::SubmitCommands { batch_id, commands })
                        .await?;
                }
            }

            Packet::Snapshot(snapshot) => {
                self.mirror.apply_snapshot(&snapshot)?;
                self.objects.sync(&self.mirror);
            }

            Packet::Delta(delta) => match self.mirror.apply_delta(&delta) {
                Ok(()) => {
                    self.objects.sync(&self.mirror);
                }
                Err(e @ (MirrorError::BaseTickMismatch { .. } | MirrorError::NoBaseline { .. })) => {
                    warn!("{}, requesting resync", e);
                    self.resyncs += 1;
                    self.send_packet(&Packet::Resync {
                        match_id: self.match_id,
                    })
                    .await?;
                }
                Err(e) => return Err(e.into()),
            },

            Packet::CommandReceipt { batch_id, receipt } => {
                info!(
                    "Batch {} accepted {} commands at tick {}",
                    batch_id, receipt.accepted, receipt.tick
                );
                for (name, reason) in receipt.errors {
                    warn!("Command {} rejected: {}", name, reason);
                }
            }

            Packet::TickError(failure) => {
                warn!(
                    "Tick {}: {} failed: {}",
                    failure.tick, failure.source, failure.message
                );
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.client_id = None;
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
        Ok(())
    }

    fn report(&self) {
        info!(
            "Tick {:?}: {} entities mirrored, {} objects, {} resyncs",
            self.mirror.tick(),
            self.mirror.len(),
            self.objects.len(),
            self.resyncs
        );
        for (id, object) in self.objects.iter().take(3) {
            debug!("{}: {:?}", id, object);
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);
        let mut report_interval = interval(REPORT_INTERVAL);

        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }

                            let packet = deserialize::<Packet>(&buffer[0..len])
                                .ok()
                                .and_then(|packet| self.reassemble(packet));
                            if let Some(packet) = packet {
                                let disconnect = matches!(packet, Packet::Disconnected { .. });
                                if let Err(e) = self.handle_packet(packet).await {
                                    error!("Error handling packet: {}", e);
                                }
                                if disconnect {
                                    break;
                                }
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat_interval.tick() => {
                    if self.connected {
                        if let Err(e) = self.send_packet(&Packet::Heartbeat).await {
                            error!("Error sending heartbeat: {}", e);
                        }
                    }
                },

                _ = report_interval.tick() => {
                    self.report();
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, leaving");
                    break;
                },
            }
        }

        if self.connected {
            let _ = self.send_packet(&Packet::Disconnect).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::FieldMapping;

    #[derive(Debug, Default)]
    struct Marker {
        value: f32,
    }

    fn registry() -> DomainRegistry<Marker> {
        DomainRegistry::new(
            FieldMapping::<Marker>::new("markers", "MARKER")
                .bind("VALUE", |marker, value| marker.value = value),
        )
    }

    #[test]
    fn test_invalid_server_address() {
        let result = tokio_test::block_on(Client::new(
            "not-an-address",
            MatchId(1),
            registry(),
            0,
            0,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_spawn_commands_follow_mapping() {
        let client = tokio_test::block_on(Client::new(
            "127.0.0.1:8080",
            MatchId(4),
            registry(),
            0,
            3,
        ))
        .unwrap();

        let commands = client.spawn_commands();
        assert_eq!(commands.len(), 3);
        for command in &commands {
            assert_eq!(command.name, "spawn");
            assert_eq!(command.payload.int("matchId").unwrap(), 4);
            assert_eq!(command.payload.float("MARKER").unwrap(), 1.0);
            let value = command.payload.float("VALUE").unwrap();
            assert!((0.0..f64::from(SPAWN_RANGE)).contains(&value));
        }
        assert!(client.mirror().is_empty());
        assert!(client.objects().is_empty());
    }

    #[test]
    fn test_owned_only_changes_subscription() {
        let client = tokio_test::block_on(Client::new(
            "127.0.0.1:8080",
            MatchId(2),
            registry(),
            0,
            0,
        ))
        .unwrap();
        assert_eq!(
            client.subscription(),
            Packet::Subscribe {
                match_id: MatchId(2)
            }
        );

        let client = client.with_owned_only(true);
        assert_eq!(
            client.subscription(),
            Packet::SubscribeOwned {
                match_id: MatchId(2)
            }
        );
    }

    #[test]
    fn test_fragments_are_reassembled() {
        let mut client = tokio_test::block_on(Client::new(
            "127.0.0.1:8080",
            MatchId(1),
            registry(),
            0,
            0,
        ))
        .unwrap();

        assert_eq!(client.reassemble(Packet::Heartbeat), Some(Packet::Heartbeat));

        let packet = Packet::Disconnected {
            reason: "x".repeat(150_000),
        };
        let mut fragments: Vec<Packet> = shared::encode_datagrams(&packet, 7)
            .unwrap()
            .iter()
            .map(|datagram| deserialize(datagram).unwrap())
            .collect();
        assert!(fragments.len() > 1);

        let last = fragments.pop().unwrap();
        for fragment in fragments {
            assert!(client.reassemble(fragment).is_none());
        }
        assert_eq!(client.reassemble(last), Some(packet));

        let bad = Packet::Fragment {
            message_id: 8,
            index: 3,
            count: 2,
            bytes: Vec::new(),
        };
        assert!(client.reassemble(bad).is_none());
    }
}
