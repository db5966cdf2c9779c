//! Collaborator contracts (§6): the interfaces the migration core consumes
//! but does not implement. Each is an object-safe trait so the supervisor
//! can hold `Arc<dyn ClusterMap>` etc. and swap a production implementation
//! for an in-memory fake in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use slotstore_core::{MigrationJobName, NodeId, SlotRangeList};
use thiserror::Error;

/// Non-blocking errors a [`Session`] can surface. `WouldBlock` is not an
/// error in the usual sense -- it is the normal "nothing ready yet" result
/// the cooperative driver expects and must not treat as failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("would block")]
    WouldBlock,
    #[error("connection closed")]
    Closed,
    #[error("{0}")]
    Io(String),
}

/// The bound control-channel connection a migration job drives. Read/write
/// are raw bytes; the FSM layers [`super::wire::SyncSlotsCodec`] on top so
/// this trait stays transport-only (a real `TcpStream` in production, an
/// in-memory duplex pipe in tests).
pub trait Session: Send {
    /// Drives connection establishment. `Ok(true)` once connected,
    /// `Ok(false)` while still in progress.
    fn try_connect(&mut self) -> Result<bool, SessionError>;

    /// Reads whatever is available into `buf`, returning the byte count.
    /// `Ok(0)` means "nothing ready", not EOF; a closed peer is reported as
    /// `Err(SessionError::Closed)`.
    fn try_read(&mut self, buf: &mut BytesMut) -> Result<usize, SessionError>;

    /// Writes as many bytes of `data` as the socket buffer currently
    /// accepts, returning the count actually written.
    fn try_write(&mut self, data: &[u8]) -> Result<usize, SessionError>;

    /// Drives one step of the authentication handshake.
    fn authenticate(&mut self) -> Result<bool, SessionError>;

    /// Bytes currently queued to be written to this session's peer -- the
    /// client output buffer the export FSM checks against
    /// `slot_migration_max_failover_repl_bytes` before pausing (§4.4, §7).
    fn buffered_bytes(&self) -> usize;
}

/// A process-wide, singleton snapshot producer handle. `poll` is
/// non-blocking; the FSM calls it once per tick while `Running`.
pub trait SnapshotHandle: Send {
    fn poll(&mut self) -> SnapshotStatus;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    Running,
    Done,
    Failed(String),
}

/// Why a snapshot could not be started. `Busy` is not a hard failure --
/// the spec's "no other child process is active" precondition (§4.4) is
/// expected to be hit routinely when two export jobs reach `WAIT_SNAPSHOT`
/// close together, and the caller retries rather than failing the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStartError {
    Busy,
    Failed(String),
}

/// Produces a one-shot snapshot stream for a set of slot ranges. Per §9,
/// implementations may fork a child process, spawn a worker thread, or
/// drive a streaming coroutine -- the core only needs the completion
/// signal via [`SnapshotHandle::poll`]. Implementations own the
/// process-wide "only one snapshot at a time" enforcement themselves and
/// report contention as [`SnapshotStartError::Busy`] rather than silently
/// running two snapshots side by side.
pub trait SnapshotProducer: Send + Sync {
    fn start_snapshot(&self, ranges: &SlotRangeList) -> Result<Box<dyn SnapshotHandle>, SnapshotStartError>;
}

/// Registers/unregisters an export job's interest in replicated writes.
/// The actual fan-out (`feed`) runs on the write path outside the FSM;
/// the FSM only needs to register when entering `STREAMING` and
/// unregister on any terminal transition.
pub trait ReplicationFeeder: Send + Sync {
    fn register(&self, job: MigrationJobName, ranges: SlotRangeList);
    fn unregister(&self, job: MigrationJobName);
}

/// A node's address, as returned by [`ClusterMap::lookup_node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

/// The cluster ownership map the core consults and mutates during takeover.
pub trait ClusterMap: Send + Sync {
    fn self_id(&self) -> NodeId;
    fn slot_owner(&self, slot: u16) -> Option<NodeId>;
    fn is_self_primary(&self) -> bool;
    fn lookup_node(&self, id: NodeId) -> Option<NodeAddr>;
    fn bump_epoch(&self);
    fn broadcast_topology(&self);
    fn save_and_fsync_config(&self);
    /// Claims `slot` for `owner`, removing any prior owner mapping. Used by
    /// the import FSM's takeover (§4.5 step 2).
    fn claim_slot(&self, slot: u16, owner: NodeId);
}

/// Key-space operations the import cleanup path and the takeover need.
pub trait KeySpace: Send + Sync {
    fn delete_keys_in_slot(&self, db: u32, slot: u16);
    fn set_slot_importing(&self, db: u32, slot: u16, importing: bool);
    fn any_slot_manually_importing(&self) -> bool;
}

/// Scopes a process-wide write pause so independent subsystems can request
/// pauses without interfering (glossary: "pause purpose").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PausePurpose {
    SlotMigration,
}

/// The process-wide write-pause facility. The invariant "no deadlines set
/// => unpause" is enforced by the supervisor polling every job each tick
/// (§9), not by drop order, so a plain handle suffices.
pub trait PauseFacility: Send + Sync {
    fn pause(&self, purpose: PausePurpose, deadline_ms: i64);
    fn unpause(&self, purpose: PausePurpose);
    fn paused(&self, purpose: PausePurpose) -> bool;
}

/// The full set of collaborators a job's driver needs, bundled for
/// convenience so `ExportJob::drive`/`ImportJob::drive` take one argument.
pub struct Collaborators {
    pub cluster_map: Arc<dyn ClusterMap>,
    pub key_space: Arc<dyn KeySpace>,
    pub snapshot_producer: Arc<dyn SnapshotProducer>,
    pub replication_feeder: Arc<dyn ReplicationFeeder>,
    pub pause_facility: Arc<dyn PauseFacility>,
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    #[test]
    fn duplex_pair_delivers_bytes() {
        let (mut a, mut b) = duplex_pair();
        assert_eq!(a.try_write(b"hello").unwrap(), 5);
        let mut buf = BytesMut::new();
        assert_eq!(b.try_read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn closed_session_reports_closed() {
        let (a, mut b) = duplex_pair();
        a.close();
        let mut buf = BytesMut::new();
        assert_eq!(b.try_read(&mut buf), Err(SessionError::Closed));
    }

    #[test]
    fn pause_facility_tracks_single_purpose() {
        let facility = FakePauseFacility::default();
        assert!(!facility.paused(PausePurpose::SlotMigration));
        facility.pause(PausePurpose::SlotMigration, 1000);
        assert!(facility.paused(PausePurpose::SlotMigration));
        facility.unpause(PausePurpose::SlotMigration);
        assert!(!facility.paused(PausePurpose::SlotMigration));
    }
}
