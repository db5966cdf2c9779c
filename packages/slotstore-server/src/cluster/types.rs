//! The migration job model (§4.2-§4.3): two distinct state enums and two
//! distinct job structs so an export can never carry an import-only state
//! and vice versa. `MigrationJob` is the enum the supervisor actually
//! stores; most call sites match on it once and forward to the concrete
//! job.

use bytes::BytesMut;
use slotstore_core::{MigrationJobName, NodeId, SlotRangeList};

use crate::cluster::collab::{Session, SnapshotHandle};
use crate::cluster::wire::SyncSlotsCodec;
use crate::error::JobError;

/// Which side of a migration a job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Export,
    Import,
}

/// The source-side state machine (§4.4). Connection bootstrap is broken
/// into the same five steps the control-channel handshake takes on the
/// wire, so a stuck job's `state` names exactly which round trip is
/// outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Connect,
    SendAuth,
    ReadAuth,
    SendEstablish,
    ReadEstablish,
    WaitSnapshot,
    Snapshotting,
    Streaming,
    WaitPause,
    FailoverPaused,
    FailoverGranted,
    Success,
    Failed,
    Cancelled,
}

impl ExportState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// The target-side state machine (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    WaitAck,
    ReceivingSnapshot,
    WaitPaused,
    FailoverRequested,
    FailoverGranted,
    /// Takeover has run (epoch bumped, slots claimed, config saved and
    /// broadcast) but the importing markers have not been cleared yet.
    /// Split out from `Success` per the open-question resolution in §9: a
    /// crash between takeover and marker cleanup must not look like a
    /// fresh, unclaimed slot on restart.
    FinishedWaitingToCleanup,
    Success,
    Failed,
    Cancelled,
}

impl ImportState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// Fields both job kinds carry, factored out so `ExportJob`/`ImportJob`
/// don't each redeclare bookkeeping that means the same thing on both
/// sides.
#[derive(Debug, Clone)]
pub struct JobMeta {
    pub name: MigrationJobName,
    pub peer_node_id: NodeId,
    pub ranges: SlotRangeList,
    pub created_ms: i64,
    pub last_update_ms: i64,
    pub last_ack_ms: i64,
    pub status_msg: String,
}

impl JobMeta {
    #[must_use]
    pub fn new(
        name: MigrationJobName,
        peer_node_id: NodeId,
        ranges: SlotRangeList,
        now: i64,
    ) -> Self {
        Self {
            name,
            peer_node_id,
            ranges,
            created_ms: now,
            last_update_ms: now,
            last_ack_ms: now,
            status_msg: String::new(),
        }
    }

    pub fn touch(&mut self, now: i64) {
        self.last_update_ms = now;
    }

    pub fn record_ack(&mut self, now: i64) {
        self.last_ack_ms = now;
        self.touch(now);
    }
}

/// Drives the source side of one slot range set moving off this node.
pub struct ExportJob {
    pub meta: JobMeta,
    pub state: ExportState,
    /// Set once `WAIT_PAUSE` is entered; `None` beforehand. The invariant
    /// "no outstanding deadline implies not paused" (§9) is enforced by the
    /// supervisor clearing the process pause whenever this goes back to
    /// `None` on a terminal transition.
    pub pause_deadline_ms: Option<i64>,
    /// When the last keepalive `ACK` was enqueued, so the supervisor can
    /// hold the 1 Hz cap from §4.4/§8 (testable property 7) without a
    /// dedicated timer.
    pub(crate) last_ack_sent_ms: Option<i64>,
    pub session: Box<dyn Session>,
    pub(crate) codec: SyncSlotsCodec,
    pub(crate) recv_buf: BytesMut,
    pub(crate) send_buf: BytesMut,
    pub(crate) snapshot: Option<Box<dyn SnapshotHandle>>,
}

impl ExportJob {
    #[must_use]
    pub fn new(meta: JobMeta, session: Box<dyn Session>) -> Self {
        Self {
            meta,
            state: ExportState::Connect,
            pause_deadline_ms: None,
            last_ack_sent_ms: None,
            session,
            codec: SyncSlotsCodec,
            recv_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
            snapshot: None,
        }
    }

    /// Whether this job's current state permits a keepalive `ACK` (§4.4:
    /// not while `SNAPSHOTTING`/`CONNECT`/`AUTH`/`ESTABLISH`).
    #[must_use]
    pub(crate) fn ack_permitted(&self) -> bool {
        !matches!(
            self.state,
            ExportState::Connect
                | ExportState::SendAuth
                | ExportState::ReadAuth
                | ExportState::SendEstablish
                | ExportState::ReadEstablish
                | ExportState::Snapshotting
        ) && !self.state.is_terminal()
    }

    /// Enqueues an `ACK` if the job's state permits one and at least a
    /// second has passed since the last one was sent.
    pub(crate) fn maybe_send_ack(&mut self, now: i64) {
        if !self.ack_permitted() {
            return;
        }
        if self.last_ack_sent_ms.is_some_and(|t| now - t < 1000) {
            return;
        }
        if crate::cluster::wire::enqueue(&mut self.codec, &mut self.send_buf, crate::cluster::wire::SyncSlotsFrame::Ack).is_ok() {
            self.last_ack_sent_ms = Some(now);
            let _ = crate::cluster::wire::pump_write(&mut *self.session, &mut self.send_buf);
        }
    }

    fn fail(&mut self, now: i64, err: JobError) {
        self.meta.status_msg = err.to_string();
        self.meta.touch(now);
        self.state = ExportState::Failed;
        self.pause_deadline_ms = None;
    }

    pub(crate) fn fail_with(&mut self, now: i64, err: JobError) {
        self.fail(now, err);
    }

    pub fn cancel(&mut self, now: i64) {
        if !self.state.is_terminal() {
            self.meta.status_msg = JobError::Cancelled.to_string();
            self.meta.touch(now);
            self.state = ExportState::Cancelled;
            self.pause_deadline_ms = None;
        }
    }
}

/// Drives the target side of one slot range set moving onto this node.
pub struct ImportJob {
    pub meta: JobMeta,
    pub state: ImportState,
    /// See [`ExportJob::last_ack_sent_ms`].
    pub(crate) last_ack_sent_ms: Option<i64>,
    pub session: Box<dyn Session>,
    pub(crate) codec: SyncSlotsCodec,
    pub(crate) recv_buf: BytesMut,
    pub(crate) send_buf: BytesMut,
    /// Set when a failure sends the job through `FinishedWaitingToCleanup`
    /// instead of straight to `Failed` -- the error the next `drive()` pass
    /// should land on once cleanup has run. `None` while the side-visit is
    /// the ordinary success path out of takeover.
    pub(crate) pending_failure: Option<JobError>,
}

impl ImportJob {
    #[must_use]
    pub fn new(meta: JobMeta, session: Box<dyn Session>) -> Self {
        Self {
            meta,
            state: ImportState::WaitAck,
            last_ack_sent_ms: None,
            session,
            codec: SyncSlotsCodec,
            recv_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
            pending_failure: None,
        }
    }

    /// Whether this job's current state permits a keepalive `ACK` (§8
    /// testable property 7: never in `IMPORT_WAIT_ACK`).
    #[must_use]
    pub(crate) fn ack_permitted(&self) -> bool {
        !matches!(self.state, ImportState::WaitAck) && !self.state.is_terminal()
    }

    /// Enqueues an `ACK` if the job's state permits one and at least a
    /// second has passed since the last one was sent.
    pub(crate) fn maybe_send_ack(&mut self, now: i64) {
        if !self.ack_permitted() {
            return;
        }
        if self.last_ack_sent_ms.is_some_and(|t| now - t < 1000) {
            return;
        }
        if crate::cluster::wire::enqueue(&mut self.codec, &mut self.send_buf, crate::cluster::wire::SyncSlotsFrame::Ack).is_ok() {
            self.last_ack_sent_ms = Some(now);
            let _ = crate::cluster::wire::pump_write(&mut *self.session, &mut self.send_buf);
        }
    }

    /// Builds an import job that already has bytes buffered past the
    /// `ESTABLISH` frame -- the inbound listener reads straight off the
    /// socket to parse that frame before an `ImportJob` exists at all, and
    /// whatever the peer sent in the same write (e.g. a prompt `ACK`) would
    /// otherwise be lost.
    #[must_use]
    pub fn new_with_buffered(meta: JobMeta, session: Box<dyn Session>, buffered: BytesMut) -> Self {
        let mut job = Self::new(meta, session);
        job.recv_buf = buffered;
        job
    }

    fn fail(&mut self, now: i64, err: JobError) {
        self.meta.status_msg = err.to_string();
        self.meta.touch(now);
        self.state = ImportState::Failed;
    }

    pub(crate) fn fail_with(&mut self, now: i64, err: JobError) {
        self.fail(now, err);
    }

    /// Routes a failure through the same `FinishedWaitingToCleanup` side-visit
    /// the success path takes, recording `err` so the next `drive()` pass
    /// deletes the migrated keys, clears the importing markers, and only then
    /// lands on `Failed` (§9 open-question resolution: "on any failure,
    /// cleanup then enter FAILED").
    pub(crate) fn start_failure_cleanup(&mut self, now: i64, err: JobError) {
        self.pending_failure = Some(err);
        self.state = ImportState::FinishedWaitingToCleanup;
        self.meta.touch(now);
    }

    pub fn cancel(&mut self, now: i64) {
        if !self.state.is_terminal() {
            self.meta.status_msg = JobError::Cancelled.to_string();
            self.meta.touch(now);
            self.state = ImportState::Cancelled;
        }
    }
}

/// The supervisor's actual per-job storage. An enum rather than one struct
/// with an optional half keeps an import from ever being caught mid-way
/// through an export-only state and vice versa.
pub enum MigrationJob {
    Export(ExportJob),
    Import(ImportJob),
}

impl MigrationJob {
    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Export(_) => JobKind::Export,
            Self::Import(_) => JobKind::Import,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &JobMeta {
        match self {
            Self::Export(job) => &job.meta,
            Self::Import(job) => &job.meta,
        }
    }

    #[must_use]
    pub fn name(&self) -> MigrationJobName {
        self.meta().name
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Export(job) => job.state.is_terminal(),
            Self::Import(job) => job.state.is_terminal(),
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Export(job) if job.pause_deadline_ms.is_some())
            || matches!(
                self,
                Self::Import(job) if matches!(
                    job.state,
                    ImportState::WaitPaused | ImportState::FailoverRequested | ImportState::FailoverGranted
                )
            )
    }

    pub fn cancel(&mut self, now: i64) {
        match self {
            Self::Export(job) => job.cancel(now),
            Self::Import(job) => job.cancel(now),
        }
    }

    #[must_use]
    pub fn status_msg(&self) -> &str {
        &self.meta().status_msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::collab::fakes::duplex_pair;

    fn sample_meta() -> JobMeta {
        let name: MigrationJobName = "0123456789abcdef0123456789abcdef01234567".parse().unwrap();
        let peer: NodeId = "abcdefabcdefabcdefabcdefabcdefabcdefabcd".parse().unwrap();
        JobMeta::new(name, peer, SlotRangeList::new(), 0)
    }

    #[test]
    fn new_export_job_starts_at_connect() {
        let (a, _b) = duplex_pair();
        let job = ExportJob::new(sample_meta(), Box::new(a));
        assert_eq!(job.state, ExportState::Connect);
        assert!(job.pause_deadline_ms.is_none());
    }

    #[test]
    fn new_import_job_starts_at_wait_ack() {
        let (a, _b) = duplex_pair();
        let job = ImportJob::new(sample_meta(), Box::new(a));
        assert_eq!(job.state, ImportState::WaitAck);
    }

    #[test]
    fn cancel_is_idempotent_once_terminal() {
        let (a, _b) = duplex_pair();
        let mut job = ExportJob::new(sample_meta(), Box::new(a));
        job.state = ExportState::Success;
        job.cancel(10);
        assert_eq!(job.state, ExportState::Success, "terminal state must not be overwritten");
    }

    #[test]
    fn migration_job_dispatches_kind_and_name() {
        let (a, _b) = duplex_pair();
        let meta = sample_meta();
        let name = meta.name;
        let job = MigrationJob::Export(ExportJob::new(meta, Box::new(a)));
        assert_eq!(job.kind(), JobKind::Export);
        assert_eq!(job.name(), name);
        assert!(!job.is_terminal());
    }
}
