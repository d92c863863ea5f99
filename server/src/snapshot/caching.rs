//! Per-match snapshot cache fed by dirty tracking
//!
//! Every call consumes the match's dirty info. No changes means the cached
//! `Arc` is handed back as is; otherwise the cached snapshot is cloned
//! (cheap, persistent columns) and only the dirty entities are re-read.
//! A full rebuild happens on the first request, after the installed modules
//! change, when the cached build is older than the configured age, or when
//! the dirty set is large relative to the snapshot.
//!
//! The provider reads the live store. Inside the engine only the snapshot
//! publisher calls it, between ticks; everyone else reads the published
//! snapshots of the [`SnapshotHub`](crate::publish::SnapshotHub).

use super::{read_owner, Snapshot, SnapshotBuilder};
use crate::config::CacheConfig;
use crate::module::ModuleResolver;
use crate::store::{
    is_null, DirtyInfo, DirtyTracking, DirtyTrackingStore, EntityComponentStore, LockingStore,
};
use crate::tick::TickCounter;
use log::{debug, trace};
use parking_lot::Mutex;
use serde::Serialize;
use shared::{MatchId, PlayerId, Tick};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    Initial,
    ModulesChanged,
    Expired,
    ChangeRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Hit,
    Incremental,
    Rebuilt(RebuildReason),
}

impl RefreshKind {
    /// Whether the consumed changes fully describe the step from the
    /// previously cached snapshot to the new one.
    pub fn changes_are_exact(&self) -> bool {
        !matches!(
            self,
            RefreshKind::Rebuilt(RebuildReason::Initial | RebuildReason::ModulesChanged)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotRefresh {
    /// Cached snapshot before this call.
    pub previous: Option<Arc<Snapshot>>,
    pub snapshot: Arc<Snapshot>,
    /// Dirty info consumed by this call.
    pub changes: DirtyInfo,
    pub kind: RefreshKind,
}

/// Point-in-time copy of the provider's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SnapshotMetrics {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub incremental_updates: u64,
    pub full_rebuilds: u64,
    pub last_generation_ms: f64,
    pub avg_generation_ms: f64,
    pub max_generation_ms: f64,
    pub cached_matches: usize,
}

impl SnapshotMetrics {
    /// Share of requests answered without touching the store, or 0 before
    /// the first request.
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    incremental: AtomicU64,
    rebuilds: AtomicU64,
    last_nanos: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl Counters {
    fn record_time(&self, started: Instant) {
        let nanos = started.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.last_nanos.store(nanos, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.total,
            &self.hits,
            &self.misses,
            &self.incremental,
            &self.rebuilds,
            &self.last_nanos,
            &self.total_nanos,
            &self.max_nanos,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
struct CachedSnapshot {
    snapshot: Arc<Snapshot>,
    generation: u64,
    built_tick: Tick,
}

/// Keeps the latest snapshot of every requested match and patches it from
/// the dirty info of the wrapped store.
///
/// A refresh holds the cache lock and then the store's read lock for its
/// whole duration. Nothing else takes those two locks in the other order.
pub struct CachingSnapshotProvider<S> {
    store: LockingStore<DirtyTrackingStore<S>>,
    modules: Arc<dyn ModuleResolver>,
    ticks: TickCounter,
    config: CacheConfig,
    builder: SnapshotBuilder,
    cache: Mutex<HashMap<MatchId, CachedSnapshot>>,
    last_changes: Mutex<HashMap<MatchId, DirtyInfo>>,
    counters: Counters,
}

impl<S: EntityComponentStore> CachingSnapshotProvider<S> {
    /// Creates an empty provider over `store`.
    ///
    /// `modules` decides what a snapshot contains and `ticks` stamps every
    /// build. Nothing is built until the first request.
    pub fn new(
        store: LockingStore<DirtyTrackingStore<S>>,
        modules: Arc<dyn ModuleResolver>,
        ticks: TickCounter,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            modules,
            ticks,
            config,
            builder: SnapshotBuilder::new(),
            cache: Mutex::new(HashMap::new()),
            last_changes: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Current snapshot of `match_id`.
    ///
    /// Consumes the match's dirty info like [`refresh`](Self::refresh).
    pub fn snapshot(&self, match_id: MatchId) -> Arc<Snapshot> {
        self.refresh(match_id).snapshot
    }

    /// Current snapshot plus what changed since the previously cached one.
    ///
    /// Returns the cached `Arc` untouched when nothing changed, patches it
    /// when a few entities changed and rebuilds it otherwise; `kind` says
    /// which happened.
    pub fn refresh(&self, match_id: MatchId) -> SnapshotRefresh {
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        // Held for the whole call: consuming dirty info and patching the
        // cache must not interleave with another refresh of the same match.
        let mut cache = self.cache.lock();
        let store = self.store.read();
        let tick = self.ticks.current();
        let generation = self.modules.generation();
        let changes = store.consume_dirty_info(match_id);
        let previous = cache.get(&match_id).map(|c| Arc::clone(&c.snapshot));

        let rebuild = match cache.get(&match_id) {
            None => Some(RebuildReason::Initial),
            Some(cached) if cached.generation != generation => Some(RebuildReason::ModulesChanged),
            Some(cached) if self.is_expired(cached, tick) => Some(RebuildReason::Expired),
            Some(cached) if self.exceeds_ratio(&changes, &cached.snapshot) => {
                Some(RebuildReason::ChangeRatio)
            }
            Some(_) => None,
        };

        let (snapshot, kind) = match (rebuild, previous.as_ref()) {
            (None, Some(cached)) if changes.is_empty() => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!("Snapshot cache hit for {}", match_id);
                (Arc::clone(cached), RefreshKind::Hit)
            }
            (None, Some(cached)) => {
                let patched = self.patch(&*store, cached, &changes, tick);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.counters.incremental.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "Patched snapshot for {} with {} changes",
                    match_id,
                    changes.total_changes()
                );
                let built_tick = cache.get(&match_id).map_or(tick, |c| c.built_tick);
                let snapshot = Arc::new(patched);
                cache.insert(
                    match_id,
                    CachedSnapshot {
                        snapshot: Arc::clone(&snapshot),
                        generation,
                        built_tick,
                    },
                );
                (snapshot, RefreshKind::Incremental)
            }
            (reason, _) => {
                let reason = reason.unwrap_or(RebuildReason::Initial);
                let modules = self.modules.modules();
                let snapshot = Arc::new(self.builder.build(&*store, &modules, match_id, tick));
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.counters.rebuilds.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Rebuilt snapshot for {} at tick {} ({:?})",
                    match_id, tick, reason
                );
                cache.insert(
                    match_id,
                    CachedSnapshot {
                        snapshot: Arc::clone(&snapshot),
                        generation,
                        built_tick: tick,
                    },
                );
                (snapshot, RefreshKind::Rebuilt(reason))
            }
        };
        drop(store);
        drop(cache);

        self.last_changes.lock().insert(match_id, changes.clone());
        self.counters.record_time(started);

        SnapshotRefresh {
            previous,
            snapshot,
            changes,
            kind,
        }
    }

    fn is_expired(&self, cached: &CachedSnapshot, tick: Tick) -> bool {
        self.config
            .max_age_ticks
            .map_or(false, |max_age| tick.saturating_sub(cached.built_tick) > max_age)
    }

    fn exceeds_ratio(&self, changes: &DirtyInfo, cached: &Snapshot) -> bool {
        let base = cached.membership_count().max(1) as f64;
        changes.total_changes() as f64 > base * self.config.rebuild_threshold
    }

    fn patch<T>(&self, store: &T, cached: &Snapshot, changes: &DirtyInfo, tick: Tick) -> Snapshot
    where
        T: EntityComponentStore + ?Sized,
    {
        let mut snapshot = cached.clone();
        snapshot.tick = tick;
        let match_id = snapshot.match_id;

        for module in &mut snapshot.modules {
            for entity in &changes.removed {
                if module.entities.remove(entity).is_some() {
                    for column in &mut module.components {
                        column.values.remove(entity);
                    }
                }
            }

            for entity in changes.touched() {
                let member = store.match_of(entity) == Some(match_id)
                    && store.has_component(entity, module.flag);

                if member {
                    module.entities.insert(entity);
                    for column in &mut module.components {
                        let value = store.get_component(entity, column.id);
                        if is_null(value) {
                            column.values.remove(&entity);
                        } else {
                            column.values.insert(entity, value);
                        }
                    }
                } else if module.entities.remove(&entity).is_some() {
                    for column in &mut module.components {
                        column.values.remove(&entity);
                    }
                }
            }
        }

        for entity in &changes.removed {
            snapshot.owners.remove(entity);
        }
        for entity in changes.touched() {
            let owner = read_owner(store, entity).filter(|_| snapshot.contains(entity));
            match owner {
                Some(owner) => {
                    snapshot.owners.insert(entity, owner);
                }
                None => {
                    snapshot.owners.remove(&entity);
                }
            }
        }
        snapshot
    }

    /// Builds the snapshot of `match_id` restricted to entities owned by
    /// `player`.
    ///
    /// Player views are not cached and do not consume dirty info, so they
    /// never disturb the per-match cache.
    pub fn player_snapshot(&self, match_id: MatchId, player: PlayerId) -> Snapshot {
        let store = self.store.read();
        let modules = self.modules.modules();
        self.builder
            .build_for_player(&*store, &modules, match_id, player, self.ticks.current())
    }

    /// Drops the cached snapshot of one match; the next request rebuilds it.
    pub fn invalidate(&self, match_id: MatchId) {
        self.cache.lock().remove(&match_id);
    }

    /// Drops every cached snapshot.
    pub fn clear(&self) {
        self.cache.lock().clear();
        self.last_changes.lock().clear();
    }

    /// Number of matches with a cached snapshot.
    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    /// Dirty info consumed by the most recent request for `match_id`.
    pub fn last_changes(&self, match_id: MatchId) -> Option<DirtyInfo> {
        self.last_changes.lock().get(&match_id).cloned()
    }

    /// Request counters and generation times since creation or the last
    /// [`reset_metrics`](Self::reset_metrics).
    pub fn metrics(&self) -> SnapshotMetrics {
        let total = self.counters.total.load(Ordering::Relaxed);
        let to_ms = |nanos: u64| nanos as f64 / 1_000_000.0;
        SnapshotMetrics {
            total_requests: total,
            cache_hits: self.counters.hits.load(Ordering::Relaxed),
            cache_misses: self.counters.misses.load(Ordering::Relaxed),
            incremental_updates: self.counters.incremental.load(Ordering::Relaxed),
            full_rebuilds: self.counters.rebuilds.load(Ordering::Relaxed),
            last_generation_ms: to_ms(self.counters.last_nanos.load(Ordering::Relaxed)),
            avg_generation_ms: if total == 0 {
                0.0
            } else {
                to_ms(self.counters.total_nanos.load(Ordering::Relaxed)) / total as f64
            },
            max_generation_ms: to_ms(self.counters.max_nanos.load(Ordering::Relaxed)),
            cached_matches: self.cache_size(),
        }
    }

    /// Zeroes every counter; cached snapshots are kept.
    pub fn reset_metrics(&self) {
        self.counters.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ComponentRef, ModuleDescriptor, ModuleRegistry};
    use crate::store::ArrayStore;
    use shared::{ComponentId, EntityId};

    const COMBATANT: ComponentId = ComponentId(3);
    const HEALTH: ComponentId = ComponentId(4);
    const M1: MatchId = MatchId(1);

    type Store = LockingStore<DirtyTrackingStore<ArrayStore>>;

    struct Fixture {
        store: Store,
        modules: Arc<ModuleRegistry>,
        ticks: TickCounter,
        provider: CachingSnapshotProvider<ArrayStore>,
    }

    fn fixture(rebuild_threshold: f64) -> Fixture {
        let store = LockingStore::new(DirtyTrackingStore::new(ArrayStore::new(10_000, 8)));
        let modules = Arc::new(ModuleRegistry::new());
        modules.install(ModuleDescriptor::new(
            "combat",
            ComponentRef::new(COMBATANT, "COMBATANT"),
            vec![ComponentRef::new(HEALTH, "HEALTH")],
        ));
        let ticks = TickCounter::new();
        let provider = CachingSnapshotProvider::new(
            store.clone(),
            modules.clone(),
            ticks.clone(),
            CacheConfig {
                rebuild_threshold,
                max_age_ticks: None,
            },
        );
        Fixture {
            store,
            modules,
            ticks,
            provider,
        }
    }

    fn spawn(store: &mut Store, match_id: MatchId, health: f32) -> EntityId {
        let entity = store.create_entity(match_id).unwrap();
        store
            .attach_components(entity, &[COMBATANT, HEALTH], &[1.0, health])
            .unwrap();
        entity
    }

    fn full_build(f: &Fixture, match_id: MatchId) -> Snapshot {
        let guard = f.store.read();
        SnapshotBuilder::new().build(&*guard, &f.modules.modules(), match_id, f.ticks.current())
    }

    #[test]
    fn test_first_request_builds_then_hits() {
        let mut f = fixture(0.5);
        spawn(&mut f.store, M1, 100.0);

        let first = f.provider.refresh(M1);
        assert_eq!(first.kind, RefreshKind::Rebuilt(RebuildReason::Initial));
        assert!(first.previous.is_none());

        let second = f.provider.refresh(M1);
        assert_eq!(second.kind, RefreshKind::Hit);
        assert!(Arc::ptr_eq(&first.snapshot, &second.snapshot));

        let metrics = f.provider.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.full_rebuilds, 1);
        assert_eq!(metrics.cached_matches, 1);
    }

    #[test]
    fn test_incremental_update_matches_full_build() {
        let mut f = fixture(0.5);
        let entities: Vec<_> = (0..10).map(|i| spawn(&mut f.store, M1, i as f32)).collect();
        f.provider.snapshot(M1);

        f.store.attach_component(entities[3], HEALTH, 50.0).unwrap();
        f.store.remove_component(entities[4], HEALTH).unwrap();
        f.store.delete_entity(entities[5]).unwrap();
        spawn(&mut f.store, M1, 7.0);
        f.ticks.advance();

        let refresh = f.provider.refresh(M1);
        assert_eq!(refresh.kind, RefreshKind::Incremental);
        assert_eq!(refresh.changes.total_changes(), 4);
        assert_eq!(*refresh.snapshot, full_build(&f, M1));
        assert_eq!(refresh.snapshot.value("combat", "HEALTH", entities[3]), Some(50.0));
        assert_eq!(refresh.snapshot.value("combat", "HEALTH", entities[4]), None);
        assert!(!refresh.snapshot.contains(entities[5]));
    }

    #[test]
    fn test_flag_removal_drops_entity_from_module() {
        let mut f = fixture(0.9);
        let keep: Vec<_> = (0..4).map(|_| spawn(&mut f.store, M1, 1.0)).collect();
        f.provider.snapshot(M1);

        f.store.remove_component(keep[0], COMBATANT).unwrap();
        let snapshot = f.provider.snapshot(M1);
        assert!(!snapshot.contains(keep[0]));
        assert_eq!(*snapshot, full_build(&f, M1));
    }

    #[test]
    fn test_large_change_ratio_rebuilds() {
        let mut f = fixture(0.5);
        let entities: Vec<_> = (0..4).map(|_| spawn(&mut f.store, M1, 1.0)).collect();
        f.provider.snapshot(M1);

        for entity in &entities[..3] {
            f.store.attach_component(*entity, HEALTH, 2.0).unwrap();
        }
        let refresh = f.provider.refresh(M1);
        assert_eq!(refresh.kind, RefreshKind::Rebuilt(RebuildReason::ChangeRatio));
        assert!(refresh.kind.changes_are_exact());
        assert_eq!(*refresh.snapshot, full_build(&f, M1));
    }

    #[test]
    fn test_module_change_invalidates() {
        let mut f = fixture(0.5);
        spawn(&mut f.store, M1, 1.0);
        f.provider.snapshot(M1);

        f.modules.uninstall("combat");
        let refresh = f.provider.refresh(M1);
        assert_eq!(refresh.kind, RefreshKind::Rebuilt(RebuildReason::ModulesChanged));
        assert!(!refresh.kind.changes_are_exact());
        assert!(refresh.snapshot.modules.is_empty());
    }

    #[test]
    fn test_max_age_forces_rebuild() {
        let store = LockingStore::new(DirtyTrackingStore::new(ArrayStore::new(10, 8)));
        let ticks = TickCounter::new();
        let provider = CachingSnapshotProvider::new(
            store,
            Arc::new(ModuleRegistry::new()),
            ticks.clone(),
            CacheConfig {
                rebuild_threshold: 0.5,
                max_age_ticks: Some(2),
            },
        );

        provider.snapshot(M1);
        ticks.advance();
        ticks.advance();
        assert_eq!(provider.refresh(M1).kind, RefreshKind::Hit);
        ticks.advance();
        assert_eq!(
            provider.refresh(M1).kind,
            RefreshKind::Rebuilt(RebuildReason::Expired)
        );
    }

    #[test]
    fn test_invalidate_and_clear() {
        let mut f = fixture(0.5);
        spawn(&mut f.store, M1, 1.0);
        f.provider.snapshot(M1);
        f.provider.snapshot(MatchId(2));
        assert_eq!(f.provider.cache_size(), 2);

        f.provider.invalidate(M1);
        assert_eq!(f.provider.cache_size(), 1);
        assert_eq!(
            f.provider.refresh(M1).kind,
            RefreshKind::Rebuilt(RebuildReason::Initial)
        );

        f.provider.clear();
        assert_eq!(f.provider.cache_size(), 0);
        assert!(f.provider.last_changes(M1).is_none());
    }

    #[test]
    fn test_matches_do_not_leak() {
        let mut f = fixture(0.5);
        let a = spawn(&mut f.store, M1, 1.0);
        let b = spawn(&mut f.store, MatchId(2), 1.0);
        f.provider.snapshot(M1);

        f.store.attach_component(b, HEALTH, 9.0).unwrap();
        let snapshot = f.provider.snapshot(M1);
        assert!(snapshot.contains(a));
        assert!(!snapshot.contains(b));
        // Match 2's changes were not consumed by the match 1 request.
        assert!(f.store.peek_dirty_info(MatchId(2)).added.contains(&b));
    }

    #[test]
    fn test_owner_changes_are_patched() {
        let mut f = fixture(0.9);
        let entities: Vec<_> = (0..4).map(|_| spawn(&mut f.store, M1, 1.0)).collect();
        f.store
            .attach_component(entities[0], ComponentId::OWNER_ID, 3.0)
            .unwrap();
        f.provider.snapshot(M1);

        f.store
            .attach_component(entities[1], ComponentId::OWNER_ID, 3.0)
            .unwrap();
        f.store
            .remove_component(entities[0], ComponentId::OWNER_ID)
            .unwrap();
        let refresh = f.provider.refresh(M1);

        assert_eq!(refresh.kind, RefreshKind::Incremental);
        assert_eq!(refresh.snapshot.owner(entities[0]), None);
        assert_eq!(refresh.snapshot.owner(entities[1]), Some(3));
        assert_eq!(*refresh.snapshot, full_build(&f, M1));
    }

    #[test]
    fn test_player_snapshot_is_uncached() {
        let mut f = fixture(0.5);
        let mine = spawn(&mut f.store, M1, 10.0);
        let theirs = spawn(&mut f.store, M1, 20.0);
        f.store.attach_component(mine, ComponentId::OWNER_ID, 1.0).unwrap();
        f.store.attach_component(theirs, ComponentId::OWNER_ID, 2.0).unwrap();

        let owned = f.provider.player_snapshot(M1, 1);
        assert!(owned.contains(mine));
        assert!(!owned.contains(theirs));
        assert_eq!(f.provider.cache_size(), 0);
        assert_eq!(f.provider.metrics().total_requests, 0);
        // Dirty info is left for the per-match cache.
        assert!(f.store.peek_dirty_info(M1).added.contains(&mine));
    }

    #[test]
    fn test_reset_metrics() {
        let f = fixture(0.5);
        f.provider.snapshot(M1);
        f.provider.reset_metrics();
        let metrics = f.provider.metrics();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.hit_rate(), 0.0);
    }
}
