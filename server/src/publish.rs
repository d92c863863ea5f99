//! Per-tick snapshot publication
//!
//! The tick thread refreshes every watched match once per tick and swaps the
//! result into a [`SnapshotHub`]. Readers on other threads only ever clone an
//! `Arc` out of the hub, so they never see a half-applied tick and never wait
//! for one to finish.

use crate::snapshot::{CachingSnapshotProvider, DeltaCompressor, RefreshKind, Snapshot};
use crate::store::EntityComponentStore;
use crate::tick::TickListener;
use log::{debug, trace};
use parking_lot::RwLock;
use shared::{DeltaMessage, MatchId, PlayerId, Tick};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct HubState {
    /// Watch count per match.
    watchers: HashMap<MatchId, usize>,
    latest: HashMap<MatchId, Arc<Snapshot>>,
}

/// Latest published snapshot of every watched match.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHub {
    state: Arc<RwLock<HubState>>,
}

impl SnapshotHub {
    /// An empty hub. Clones share state, so the engine and the network
    /// layer hold the same hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts publishing `match_id`. Watches are counted.
    pub fn watch(&self, match_id: MatchId) {
        let mut state = self.state.write();
        let count = state.watchers.entry(match_id).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!("Watching {}", match_id);
        }
    }

    /// Drops one watch; the last one stops publication and forgets the
    /// published snapshot.
    pub fn unwatch(&self, match_id: MatchId) {
        let mut state = self.state.write();
        let remaining = match state.watchers.get_mut(&match_id) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return,
        };
        if remaining == 0 {
            state.watchers.remove(&match_id);
            state.latest.remove(&match_id);
            debug!("Stopped watching {}", match_id);
        }
    }

    /// Watched matches, ascending.
    pub fn watched(&self) -> Vec<MatchId> {
        let mut matches: Vec<MatchId> = self.state.read().watchers.keys().copied().collect();
        matches.sort_unstable();
        matches
    }

    pub fn is_watched(&self, match_id: MatchId) -> bool {
        self.state.read().watchers.contains_key(&match_id)
    }

    /// Snapshot of the last completed tick that changed `match_id`.
    pub fn latest(&self, match_id: MatchId) -> Option<Arc<Snapshot>> {
        self.state.read().latest.get(&match_id).cloned()
    }

    /// Latest snapshot of `match_id` narrowed to the entities `player` owns.
    pub fn latest_for_player(&self, match_id: MatchId, player: PlayerId) -> Option<Snapshot> {
        self.latest(match_id).map(|snapshot| snapshot.for_player(player))
    }

    /// Stores `snapshot` if its match is still watched.
    fn publish(&self, snapshot: Arc<Snapshot>) -> bool {
        let mut state = self.state.write();
        if !state.watchers.contains_key(&snapshot.match_id) {
            return false;
        }
        state.latest.insert(snapshot.match_id, snapshot);
        true
    }
}

/// New state of one match, produced after a tick.
#[derive(Debug, Clone)]
pub struct MatchUpdate {
    pub match_id: MatchId,
    pub snapshot: Arc<Snapshot>,
    /// Changes since the previously published snapshot, absent on the first
    /// publication.
    pub delta: Option<DeltaMessage>,
}

/// Tick listener that refreshes every watched match and publishes what
/// changed.
///
/// Each publication is swapped into the [`SnapshotHub`] and sent as a
/// [`MatchUpdate`] on the channel returned by [`new`](Self::new).
pub struct SnapshotPublisher<S> {
    provider: Arc<CachingSnapshotProvider<S>>,
    hub: SnapshotHub,
    compressor: DeltaCompressor,
    updates: mpsc::UnboundedSender<MatchUpdate>,
}

impl<S: EntityComponentStore> SnapshotPublisher<S> {
    /// Creates the publisher and the receiving end of its update channel.
    pub fn new(
        provider: Arc<CachingSnapshotProvider<S>>,
        hub: SnapshotHub,
    ) -> (Self, mpsc::UnboundedReceiver<MatchUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        (
            Self {
                provider,
                hub,
                compressor: DeltaCompressor::new(),
                updates,
            },
            rx,
        )
    }

    fn publish_match(&self, match_id: MatchId) -> Option<MatchUpdate> {
        let refresh = self.provider.refresh(match_id);
        let published = self.hub.latest(match_id);

        if refresh.kind == RefreshKind::Hit {
            let unchanged = published
                .as_ref()
                .map_or(false, |p| Arc::ptr_eq(p, &refresh.snapshot));
            if unchanged {
                return None;
            }
        }

        let delta = published.map(|published| {
            let continues = refresh
                .previous
                .as_ref()
                .map_or(false, |previous| Arc::ptr_eq(previous, &published));
            if continues && refresh.kind.changes_are_exact() {
                self.compressor
                    .from_changes(&published, &refresh.snapshot, &refresh.changes)
            } else {
                self.compressor.compute(&published, &refresh.snapshot)
            }
        });

        if !self.hub.publish(Arc::clone(&refresh.snapshot)) {
            return None;
        }
        Some(MatchUpdate {
            match_id,
            snapshot: refresh.snapshot,
            delta,
        })
    }
}

impl<S: EntityComponentStore> TickListener for SnapshotPublisher<S> {
    fn on_tick_complete(&mut self, tick: Tick) {
        for match_id in self.hub.watched() {
            let Some(update) = self.publish_match(match_id) else {
                continue;
            };
            trace!(
                "Published {} at tick {} ({} changes)",
                match_id,
                tick,
                update.delta.as_ref().map_or(0, |d| d.change_count())
            );
            if self.updates.send(update).is_err() {
                debug!("Update receiver dropped");
            }
        }
    }
}
