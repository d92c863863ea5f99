//! Types shared between the match server and its streaming clients
//!
//! Everything that crosses the wire lives here: entity/match/component
//! identifiers, command payloads, the snapshot and delta messages, and the
//! UDP `Packet` envelope. Packets are bincode encoded; snapshot and delta
//! messages additionally render to the JSON reference form through
//! [`WireMessage`]. Packets too large for one datagram travel as
//! [`Packet::Fragment`]s and are put back together by a [`Reassembler`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Number of completed simulation ticks.
pub type Tick = u64;

/// Connection-scoped player identifier assigned by the server.
pub type PlayerId = u32;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

/// Logical partition of the store. Every value is a valid match; the absence
/// of a match is expressed as `Option<MatchId>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(pub u64);

/// Dense component identifier handed out by the server's component registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub u32);

impl ComponentId {
    /// Carries the owning match id, float encoded.
    pub const MATCH_ID: ComponentId = ComponentId(0);
    /// Carries the entity's own id, float encoded.
    pub const ENTITY_ID: ComponentId = ComponentId(1);
    /// Carries the id of the player owning the entity, float encoded.
    pub const OWNER_ID: ComponentId = ComponentId(2);

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "match#{}", self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Primitive value carried in a command payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CommandValue {
    fn kind(&self) -> &'static str {
        match self {
            CommandValue::Bool(_) => "bool",
            CommandValue::Int(_) => "int",
            CommandValue::Float(_) => "float",
            CommandValue::Text(_) => "text",
        }
    }
}

impl From<bool> for CommandValue {
    fn from(value: bool) -> Self {
        CommandValue::Bool(value)
    }
}

impl From<i64> for CommandValue {
    fn from(value: i64) -> Self {
        CommandValue::Int(value)
    }
}

impl From<f64> for CommandValue {
    fn from(value: f64) -> Self {
        CommandValue::Float(value)
    }
}

impl From<f32> for CommandValue {
    fn from(value: f32) -> Self {
        CommandValue::Float(value as f64)
    }
}

impl From<&str> for CommandValue {
    fn from(value: &str) -> Self {
        CommandValue::Text(value.to_string())
    }
}

impl From<String> for CommandValue {
    fn from(value: String) -> Self {
        CommandValue::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("missing field `{field}`")]
    Missing { field: String },
    #[error("field `{field}` should be {expected}, got {actual}")]
    WrongType {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("field `{field}` is out of range")]
    OutOfRange { field: String },
}

/// String-keyed map of primitive values handed to a command handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandPayload(BTreeMap<String, CommandValue>);

impl CommandPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert used when assembling payloads by hand.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<CommandValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<CommandValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&CommandValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CommandValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn require(&self, field: &str) -> Result<&CommandValue, PayloadError> {
        self.0.get(field).ok_or_else(|| PayloadError::Missing {
            field: field.to_string(),
        })
    }

    pub fn int(&self, field: &str) -> Result<i64, PayloadError> {
        match self.require(field)? {
            CommandValue::Int(v) => Ok(*v),
            other => Err(PayloadError::WrongType {
                field: field.to_string(),
                expected: "int",
                actual: other.kind(),
            }),
        }
    }

    /// Unsigned id field; negative integers are rejected.
    pub fn id(&self, field: &str) -> Result<u64, PayloadError> {
        let value = self.int(field)?;
        u64::try_from(value).map_err(|_| PayloadError::OutOfRange {
            field: field.to_string(),
        })
    }

    /// Numeric field; integers are widened.
    pub fn float(&self, field: &str) -> Result<f64, PayloadError> {
        match self.require(field)? {
            CommandValue::Float(v) => Ok(*v),
            CommandValue::Int(v) => Ok(*v as f64),
            other => Err(PayloadError::WrongType {
                field: field.to_string(),
                expected: "float",
                actual: other.kind(),
            }),
        }
    }

    pub fn text(&self, field: &str) -> Result<&str, PayloadError> {
        match self.require(field)? {
            CommandValue::Text(v) => Ok(v.as_str()),
            other => Err(PayloadError::WrongType {
                field: field.to_string(),
                expected: "text",
                actual: other.kind(),
            }),
        }
    }

    pub fn bool(&self, field: &str) -> Result<bool, PayloadError> {
        match self.require(field)? {
            CommandValue::Bool(v) => Ok(*v),
            other => Err(PayloadError::WrongType {
                field: field.to_string(),
                expected: "bool",
                actual: other.kind(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub name: String,
    pub match_id: Option<MatchId>,
    pub payload: CommandPayload,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            name: name.into(),
            match_id: None,
            payload,
        }
    }

    pub fn in_match(mut self, match_id: MatchId) -> Self {
        self.match_id = Some(match_id);
        self
    }
}

/// Result of submitting a batch of commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReceipt {
    /// Tick counter at the moment the batch was queued.
    pub tick: Tick,
    pub accepted: u32,
    /// `(command name, error message)` for every rejected command.
    pub errors: Vec<(String, String)>,
}

/// Failure caught while a tick was executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickError {
    pub tick: Tick,
    pub match_id: Option<MatchId>,
    pub player_id: Option<PlayerId>,
    /// Command or system name.
    pub source: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Snapshot wire contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    pub components: BTreeMap<String, f32>,
}

/// Changed values of an entity present on both sides of a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub id: EntityId,
    pub components: BTreeMap<String, f32>,
    /// Components the entity no longer carries.
    pub cleared: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntities {
    pub entities: Vec<EntityState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMessage {
    pub tick: Tick,
    pub match_id: MatchId,
    pub modules: BTreeMap<String, ModuleEntities>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaMessage {
    pub tick: Tick,
    pub base_tick: Tick,
    pub match_id: MatchId,
    pub added: Vec<EntityState>,
    pub modified: Vec<EntityChange>,
    pub removed: Vec<EntityId>,
}

impl DeltaMessage {
    pub fn empty(match_id: MatchId, base_tick: Tick, tick: Tick) -> Self {
        Self {
            tick,
            base_tick,
            match_id,
            added: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// JSON reference form of the streamed messages (`"type": "snapshot" | "delta"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    Snapshot(SnapshotMessage),
    Delta(DeltaMessage),
}

impl WireMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Subscribe {
        match_id: MatchId,
    },
    /// Like `Subscribe`, but only entities owned by the subscribing player
    /// are streamed.
    SubscribeOwned {
        match_id: MatchId,
    },
    Resync {
        match_id: MatchId,
    },
    SubmitCommands {
        batch_id: u32,
        commands: Vec<CommandRequest>,
    },
    Heartbeat,
    Disconnect,

    Connected {
        client_id: PlayerId,
    },
    Snapshot(SnapshotMessage),
    Delta(DeltaMessage),
    CommandReceipt {
        batch_id: u32,
        receipt: BatchReceipt,
    },
    TickError(TickError),
    Disconnected {
        reason: String,
    },

    /// Slice `index` of `count` of a bincode-encoded packet.
    Fragment {
        message_id: u32,
        index: u32,
        count: u32,
        bytes: Vec<u8>,
    },
}

// ---------------------------------------------------------------------------
// Fragmentation
// ---------------------------------------------------------------------------

/// Largest payload a UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

/// Encoded bytes carried by one fragment, leaving room for its header.
pub const FRAGMENT_PAYLOAD: usize = 60_000;

/// Upper bound on the fragments of one message accepted by a [`Reassembler`].
pub const MAX_FRAGMENTS: u32 = 4_096;

/// Encodes `packet` into datagrams no larger than [`MAX_DATAGRAM`].
///
/// A packet that fits is sent as is. Anything larger is split into
/// [`Packet::Fragment`]s tagged with `message_id`, which the sender must not
/// reuse while fragments of an earlier message may still be in flight.
pub fn encode_datagrams(packet: &Packet, message_id: u32) -> Result<Vec<Vec<u8>>, bincode::Error> {
    let data = bincode::serialize(packet)?;
    if data.len() <= MAX_DATAGRAM {
        return Ok(vec![data]);
    }

    let count = data.chunks(FRAGMENT_PAYLOAD).len() as u32;
    data.chunks(FRAGMENT_PAYLOAD)
        .enumerate()
        .map(|(index, chunk)| {
            bincode::serialize(&Packet::Fragment {
                message_id,
                index: index as u32,
                count,
                bytes: chunk.to_vec(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("fragment {index} of {count} of message {message_id} is out of range")]
    OutOfRange {
        message_id: u32,
        index: u32,
        count: u32,
    },
    #[error("message {message_id} announced {expected} fragments, then {actual}")]
    CountMismatch {
        message_id: u32,
        expected: u32,
        actual: u32,
    },
    #[error("message {message_id} did not reassemble into a packet")]
    Corrupt { message_id: u32 },
}

#[derive(Debug)]
struct PartialMessage {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Collects fragments until a whole packet is available.
///
/// Fragments may arrive in any order and duplicates are ignored. At most
/// `max_pending` incomplete messages are kept; when another one starts, the
/// oldest is dropped. A message that loses a fragment is never completed,
/// which a mirror notices as a gap in ticks.
#[derive(Debug)]
pub struct Reassembler {
    pending: BTreeMap<u32, PartialMessage>,
    max_pending: usize,
}

impl Reassembler {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Adds one fragment and returns the packet once every slice is in.
    pub fn push(
        &mut self,
        message_id: u32,
        index: u32,
        count: u32,
        bytes: Vec<u8>,
    ) -> Result<Option<Packet>, FragmentError> {
        if index >= count || count > MAX_FRAGMENTS {
            return Err(FragmentError::OutOfRange {
                message_id,
                index,
                count,
            });
        }

        if !self.pending.contains_key(&message_id) {
            while self.pending.len() >= self.max_pending {
                self.pending.pop_first();
            }
            self.pending.insert(
                message_id,
                PartialMessage {
                    parts: vec![None; count as usize],
                    received: 0,
                },
            );
        }

        let Some(message) = self.pending.get_mut(&message_id) else {
            return Ok(None);
        };
        if message.parts.len() != count as usize {
            let expected = message.parts.len() as u32;
            self.pending.remove(&message_id);
            return Err(FragmentError::CountMismatch {
                message_id,
                expected,
                actual: count,
            });
        }

        let slot = &mut message.parts[index as usize];
        if slot.is_none() {
            *slot = Some(bytes);
            message.received += 1;
        }
        if message.received < message.parts.len() {
            return Ok(None);
        }

        let Some(message) = self.pending.remove(&message_id) else {
            return Ok(None);
        };
        let data: Vec<u8> = message.parts.into_iter().flatten().flatten().collect();
        bincode::deserialize(&data)
            .map(Some)
            .map_err(|_| FragmentError::Corrupt { message_id })
    }

    /// Number of incomplete messages held.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
