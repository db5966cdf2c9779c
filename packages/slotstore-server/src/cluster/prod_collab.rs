//! Production collaborator implementations (§6). These back the traits in
//! [`super::collab`] with real concurrent state; the deeper integrations
//! they stand in for -- a full cluster gossip bus, the key-value storage
//! engine itself, an RDB-style background saver -- live outside this
//! crate's scope and are the process's job to wire in at startup.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use slotstore_core::{MigrationJobName, NodeId, SlotRangeList};
use tracing::{debug, info};

use crate::cluster::collab::{
    ClusterMap, KeySpace, NodeAddr, PauseFacility, PausePurpose, ReplicationFeeder,
    SnapshotHandle, SnapshotProducer, SnapshotStartError, SnapshotStatus,
};

/// An in-process slot ownership table plus routing addresses. A real
/// deployment keeps this synchronized across the cluster via gossip; this
/// implementation only tracks what the local node currently believes, the
/// same scope `ClusterMap` promises its callers.
pub struct InProcessClusterMap {
    self_id: NodeId,
    owners: DashMap<u16, NodeId>,
    addrs: DashMap<NodeId, NodeAddr>,
    epoch: AtomicI64,
}

impl InProcessClusterMap {
    #[must_use]
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            owners: DashMap::new(),
            addrs: DashMap::new(),
            epoch: AtomicI64::new(0),
        }
    }

    pub fn register_node(&self, id: NodeId, addr: NodeAddr) {
        self.addrs.insert(id, addr);
    }

    pub fn set_owner(&self, slot: u16, owner: NodeId) {
        self.owners.insert(slot, owner);
    }

    #[must_use]
    pub fn epoch(&self) -> i64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

impl ClusterMap for InProcessClusterMap {
    fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn slot_owner(&self, slot: u16) -> Option<NodeId> {
        self.owners.get(&slot).map(|entry| *entry)
    }

    fn is_self_primary(&self) -> bool {
        true
    }

    fn lookup_node(&self, id: NodeId) -> Option<NodeAddr> {
        self.addrs.get(&id).map(|entry| entry.clone())
    }

    fn bump_epoch(&self) {
        let next = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch = next, "cluster epoch bumped");
    }

    fn broadcast_topology(&self) {
        // The real fan-out rides the cluster bus's gossip packets; this
        // node's local view is already current by the time this is called.
        info!("topology broadcast requested");
    }

    fn save_and_fsync_config(&self) {
        debug!("cluster config save requested");
    }

    fn claim_slot(&self, slot: u16, owner: NodeId) {
        self.owners.insert(slot, owner);
    }
}

/// Tracks the "importing" markers the import FSM sets and clears (§4.5).
/// Actual key storage and deletion is the key-value engine's job; this
/// type only owns the per-slot marker bookkeeping the migration core reads.
#[derive(Default)]
pub struct MarkerKeySpace {
    importing: DashMap<(u32, u16), ()>,
}

impl MarkerKeySpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeySpace for MarkerKeySpace {
    fn delete_keys_in_slot(&self, db: u32, slot: u16) {
        debug!(db, slot, "delete_keys_in_slot requested");
    }

    fn set_slot_importing(&self, db: u32, slot: u16, importing: bool) {
        if importing {
            self.importing.insert((db, slot), ());
        } else {
            self.importing.remove(&(db, slot));
        }
    }

    fn any_slot_manually_importing(&self) -> bool {
        !self.importing.is_empty()
    }
}

/// A snapshot handle that completes immediately. Stands in for the real
/// background saver (fork a child, stream an RDB-format payload); wiring
/// that in means plugging a different `SnapshotProducer` at startup, not
/// changing anything in the migration core.
struct ImmediateSnapshotHandle {
    active: Arc<AtomicBool>,
    done: bool,
}

impl SnapshotHandle for ImmediateSnapshotHandle {
    fn poll(&mut self) -> SnapshotStatus {
        if !self.done {
            self.done = true;
            self.active.store(false, Ordering::SeqCst);
        }
        SnapshotStatus::Done
    }
}

impl Drop for ImmediateSnapshotHandle {
    fn drop(&mut self) {
        // A job can be cancelled or failed mid-snapshot without ever
        // polling to `Done`; release the singleton slot regardless so a
        // dropped handle can't wedge every future snapshot as "busy".
        if !self.done {
            self.active.store(false, Ordering::SeqCst);
        }
    }
}

/// Enforces the §4.4 "no other child process is active" precondition:
/// only one snapshot may be in flight process-wide. The real background
/// saver has exactly this constraint (one `BGSAVE`-equivalent at a time);
/// this producer tracks it with a single flag instead of forking anything.
#[derive(Default)]
pub struct ImmediateSnapshotProducer {
    active: Arc<AtomicBool>,
}

impl ImmediateSnapshotProducer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotProducer for ImmediateSnapshotProducer {
    fn start_snapshot(&self, ranges: &SlotRangeList) -> Result<Box<dyn SnapshotHandle>, SnapshotStartError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(SnapshotStartError::Busy);
        }
        info!(?ranges, "snapshot requested");
        Ok(Box::new(ImmediateSnapshotHandle {
            active: self.active.clone(),
            done: false,
        }))
    }
}

/// Registrations an export job makes while streaming (§4.4 `STREAMING`).
/// The write path that actually fans writes out to registered jobs lives
/// outside this crate; this tracks who is currently registered.
#[derive(Default)]
pub struct ChannelReplicationFeeder {
    registered: DashMap<MigrationJobName, SlotRangeList>,
}

impl ChannelReplicationFeeder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_registered(&self, job: MigrationJobName) -> bool {
        self.registered.contains_key(&job)
    }
}

impl ReplicationFeeder for ChannelReplicationFeeder {
    fn register(&self, job: MigrationJobName, ranges: SlotRangeList) {
        self.registered.insert(job, ranges);
    }

    fn unregister(&self, job: MigrationJobName) {
        self.registered.remove(&job);
    }
}

/// The process-wide write pause, keyed by purpose (§6, §9). `ArcSwap`
/// gives lock-free reads on the hot path (every write command checks
/// `paused` before proceeding) at the cost of a clone on each pause/unpause,
/// which happens orders of magnitude less often.
pub struct SharedPauseFacility {
    state: ArcSwap<im_pause::PauseState>,
}

mod im_pause {
    use super::PausePurpose;
    use std::collections::HashMap;

    #[derive(Clone, Default)]
    pub struct PauseState(pub HashMap<PausePurpose, i64>);
}

impl Default for SharedPauseFacility {
    fn default() -> Self {
        Self {
            state: ArcSwap::from_pointee(im_pause::PauseState::default()),
        }
    }
}

impl SharedPauseFacility {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PauseFacility for SharedPauseFacility {
    fn pause(&self, purpose: PausePurpose, deadline_ms: i64) {
        let mut next = (**self.state.load()).clone();
        next.0.insert(purpose, deadline_ms);
        self.state.store(Arc::new(next));
    }

    fn unpause(&self, purpose: PausePurpose) {
        let mut next = (**self.state.load()).clone();
        next.0.remove(&purpose);
        self.state.store(Arc::new(next));
    }

    fn paused(&self, purpose: PausePurpose) -> bool {
        self.state.load().0.contains_key(&purpose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(tail: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = tail;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn cluster_map_tracks_owners_and_epoch() {
        let map = InProcessClusterMap::new(node(1));
        assert_eq!(map.slot_owner(5), None);
        map.claim_slot(5, node(1));
        assert_eq!(map.slot_owner(5), Some(node(1)));
        assert_eq!(map.epoch(), 0);
        map.bump_epoch();
        assert_eq!(map.epoch(), 1);
    }

    #[test]
    fn marker_key_space_tracks_importing_flags() {
        let ks = MarkerKeySpace::new();
        assert!(!ks.any_slot_manually_importing());
        ks.set_slot_importing(0, 3, true);
        assert!(ks.any_slot_manually_importing());
        ks.set_slot_importing(0, 3, false);
        assert!(!ks.any_slot_manually_importing());
    }

    #[test]
    fn immediate_snapshot_producer_rejects_a_second_snapshot_while_one_is_in_flight() {
        let producer = ImmediateSnapshotProducer::new();
        let ranges = SlotRangeList::new();
        let first = producer.start_snapshot(&ranges).unwrap();
        let second = producer.start_snapshot(&ranges);
        assert_eq!(second.unwrap_err(), SnapshotStartError::Busy);
        drop(first);
        assert!(producer.start_snapshot(&ranges).is_ok(), "slot must free up once the handle is dropped");
    }

    #[test]
    fn pause_facility_is_shared_across_clones_of_the_arc() {
        let facility = Arc::new(SharedPauseFacility::new());
        let other: Arc<dyn PauseFacility> = facility.clone();
        other.pause(PausePurpose::SlotMigration, 100);
        assert!(facility.paused(PausePurpose::SlotMigration));
    }

    #[test]
    fn replication_feeder_tracks_registration() {
        let feeder = ChannelReplicationFeeder::new();
        let name: MigrationJobName = "0123456789abcdef0123456789abcdef01234567".parse().unwrap();
        assert!(!feeder.is_registered(name));
        feeder.register(name, SlotRangeList::new());
        assert!(feeder.is_registered(name));
        feeder.unregister(name);
        assert!(!feeder.is_registered(name));
    }
}
