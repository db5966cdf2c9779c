//! The import (target-side) driver (§4.5). An `ImportJob` is only ever
//! constructed after `ESTABLISH` has already been accepted and replied to
//! on the admin/session layer, so its first state is about confirming
//! two-way liveness, not about the handshake itself.

use tokio_util::codec::Decoder;

use crate::cluster::collab::Collaborators;
use crate::cluster::types::{ImportJob, ImportState};
use crate::cluster::wire::{self, SyncSlotsFrame};
use crate::config::MigrationConfig;
use crate::error::JobError;

/// Single-db key space used by the migration admin surface; multi-db
/// selection is out of scope (§2 non-goals).
const DB: u32 = 0;

impl ImportJob {
    pub fn drive(&mut self, now: i64, cfg: &MigrationConfig, collab: &Collaborators) {
        if self.state.is_terminal() {
            return;
        }

        if let Some(err) = self.topology_drifted(collab) {
            self.start_failure_cleanup(now, err);
            return;
        }

        if self.timed_out_on_interaction(now, cfg) {
            self.start_failure_cleanup(now, JobError::InteractionTimeout);
            return;
        }

        let result = match self.state {
            ImportState::WaitAck => self.drive_wait_ack(now),
            ImportState::ReceivingSnapshot => self.drive_receiving_snapshot(collab),
            ImportState::WaitPaused => self.drive_wait_paused(),
            ImportState::FailoverRequested => self.drive_failover_requested(collab),
            ImportState::FailoverGranted => self.drive_finish_takeover(collab),
            ImportState::FinishedWaitingToCleanup => self.drive_cleanup(now, collab),
            ImportState::Success | ImportState::Failed | ImportState::Cancelled => Ok(()),
        };

        if let Err(err) = result {
            self.start_failure_cleanup(now, err);
        } else {
            self.meta.touch(now);
            match self.state {
                ImportState::Success => {
                    metrics::counter!("slotstore_migration_import_success_total").increment(1);
                }
                ImportState::Failed => {
                    metrics::counter!("slotstore_migration_import_failed_total").increment(1);
                }
                _ => {}
            }
        }
    }

    fn timed_out_on_interaction(&self, now: i64, cfg: &MigrationConfig) -> bool {
        !matches!(
            self.state,
            ImportState::FailoverGranted | ImportState::FinishedWaitingToCleanup
        ) && now - self.meta.last_update_ms > cfg.replication_timeout_ms
    }

    /// The topology-change hook's IMPORT half (§4.7): demotion to replica,
    /// or any range's owner drifting away from the declared source without
    /// yet being claimed by this node, both end the job. A range observed
    /// owned by this node before takeover has actually run is just as
    /// wrong -- something outside this job claimed it first -- and gets
    /// the same explicit message the source-of-truth spec calls for.
    /// `FINISHED_WAITING_TO_CLEANUP` is exempt: by then this job's own
    /// takeover already made self-ownership the correct, expected state.
    fn topology_drifted(&self, collab: &Collaborators) -> Option<JobError> {
        if matches!(self.state, ImportState::FinishedWaitingToCleanup) {
            return None;
        }
        if !collab.cluster_map.is_self_primary() {
            return Some(JobError::DemotedToReplica);
        }
        let self_id = collab.cluster_map.self_id();
        let source = self.meta.peer_node_id;
        let pre_takeover = !matches!(self.state, ImportState::FailoverGranted);
        for range in self.meta.ranges.ranges() {
            for slot in range.start()..=range.end() {
                match collab.cluster_map.slot_owner(slot) {
                    None => {}
                    Some(owner) if owner == source => {}
                    Some(owner) if owner == self_id => {
                        if pre_takeover {
                            return Some(JobError::AssignedToSelf);
                        }
                    }
                    Some(_) => return Some(JobError::OwnershipChangedAway),
                }
            }
        }
        None
    }

    /// Per the open-question resolution (§9): deletes any keys this job may
    /// have already written into the migrated ranges -- they belong to
    /// whichever node actually owns the slots now, not this one -- and
    /// clears the importing markers so a retried migration doesn't find
    /// stale state. Runs on the driver's next pass through
    /// `FinishedWaitingToCleanup` after a failure, mirroring the success
    /// path's own side-visit.
    pub(crate) fn cleanup_on_failure(&self, collab: &Collaborators) {
        for range in self.meta.ranges.ranges() {
            for slot in range.start()..=range.end() {
                collab.key_space.delete_keys_in_slot(DB, slot);
                collab.key_space.set_slot_importing(DB, slot, false);
            }
        }
    }

    /// Called by the key-value engine's apply path (out of scope per §2)
    /// when applying the snapshot or streamed writes for this job runs the
    /// process out of memory. Not reached through `drive()` since the apply
    /// step itself lives outside this crate's core.
    pub fn report_oom(&mut self, now: i64, _collab: &Collaborators) {
        if self.state.is_terminal() {
            return;
        }
        self.start_failure_cleanup(now, JobError::OutOfMemory);
    }

    fn next_frame(&mut self) -> Result<Option<SyncSlotsFrame>, JobError> {
        wire::pump_read(&mut *self.session, &mut self.recv_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        self.codec
            .decode(&mut self.recv_buf)
            .map_err(|_| JobError::UnexpectedTransition)
    }

    fn send(&mut self, frame: SyncSlotsFrame) -> Result<(), JobError> {
        wire::enqueue(&mut self.codec, &mut self.send_buf, frame)
            .map_err(|e| JobError::EstablishFailed(e.to_string()))?;
        wire::pump_write(&mut *self.session, &mut self.send_buf)
            .map_err(|_| JobError::ConnectionLost)
    }

    fn drive_wait_ack(&mut self, now: i64) -> Result<(), JobError> {
        match self.next_frame()? {
            Some(SyncSlotsFrame::Ack) => {
                self.meta.record_ack(now);
                self.state = ImportState::ReceivingSnapshot;
                Ok(())
            }
            Some(_) => Err(JobError::UnexpectedTransition),
            None => Ok(()),
        }
    }

    fn drive_receiving_snapshot(&mut self, collab: &Collaborators) -> Result<(), JobError> {
        match self.next_frame()? {
            Some(SyncSlotsFrame::SnapshotEof) => {
                for range in self.meta.ranges.ranges() {
                    for slot in range.start()..=range.end() {
                        collab.key_space.set_slot_importing(DB, slot, true);
                    }
                }
                self.send(SyncSlotsFrame::RequestPause)?;
                self.state = ImportState::WaitPaused;
                Ok(())
            }
            Some(_) => Err(JobError::UnexpectedTransition),
            None => Ok(()),
        }
    }

    fn drive_wait_paused(&mut self) -> Result<(), JobError> {
        match self.next_frame()? {
            Some(SyncSlotsFrame::Paused) => {
                self.send(SyncSlotsFrame::RequestFailover)?;
                self.state = ImportState::FailoverRequested;
                Ok(())
            }
            Some(_) => Err(JobError::UnexpectedTransition),
            None => Ok(()),
        }
    }

    fn drive_failover_requested(&mut self, _collab: &Collaborators) -> Result<(), JobError> {
        match self.next_frame()? {
            Some(SyncSlotsFrame::FailoverGranted) => {
                self.state = ImportState::FailoverGranted;
                Ok(())
            }
            Some(_) => Err(JobError::UnexpectedTransition),
            None => Ok(()),
        }
    }

    /// Takeover (§4.5 step 2): bump the epoch, claim every slot this job
    /// moved, persist and broadcast the new topology. Runs once, on first
    /// entry to `FailoverGranted`.
    fn drive_finish_takeover(&mut self, collab: &Collaborators) -> Result<(), JobError> {
        let self_id = collab.cluster_map.self_id();
        collab.cluster_map.bump_epoch();
        for range in self.meta.ranges.ranges() {
            for slot in range.start()..=range.end() {
                collab.cluster_map.claim_slot(slot, self_id);
            }
        }
        collab.cluster_map.save_and_fsync_config();
        collab.cluster_map.broadcast_topology();
        self.state = ImportState::FinishedWaitingToCleanup;
        Ok(())
    }

    /// The `FINISHED_WAITING_TO_CLEANUP` side-visit (§4.5 step 2, §9):
    /// clears the importing markers either way, but a recorded
    /// `pending_failure` redirects the landing state to `Failed` instead of
    /// `Success` and additionally deletes the migrated keys, since on that
    /// path they were never meant to end up owned by this node.
    fn drive_cleanup(&mut self, now: i64, collab: &Collaborators) -> Result<(), JobError> {
        if let Some(err) = self.pending_failure.take() {
            self.cleanup_on_failure(collab);
            self.fail_with(now, err);
            return Ok(());
        }
        for range in self.meta.ranges.ranges() {
            for slot in range.start()..=range.end() {
                collab.key_space.set_slot_importing(DB, slot, false);
            }
        }
        self.state = ImportState::Success;
        self.meta.touch(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::collab::fakes::{duplex_pair, fake_collaborators};
    use crate::cluster::collab::ClusterMap;
    use crate::cluster::types::JobMeta;
    use crate::cluster::wire::SyncSlotsCodec;
    use slotstore_core::{MigrationJobName, NodeId, SlotRange, SlotRangeList};
    use tokio_util::codec::Encoder;

    fn sample_meta() -> JobMeta {
        let name: MigrationJobName = "0123456789abcdef0123456789abcdef01234567".parse().unwrap();
        let peer: NodeId = "abcdefabcdefabcdefabcdefabcdefabcdefabcd".parse().unwrap();
        let mut ranges = SlotRangeList::new();
        ranges.try_push(SlotRange::new(0, 2).unwrap()).unwrap();
        JobMeta::new(name, peer, ranges, 0)
    }

    fn send_from_peer(peer: &mut impl crate::cluster::collab::Session, frame: SyncSlotsFrame) {
        let mut codec = SyncSlotsCodec;
        let mut buf = bytes::BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        peer.try_write(&buf).unwrap();
    }

    #[test]
    fn full_happy_path_reaches_success_and_clears_importing_markers() {
        let (mine, mut peer) = duplex_pair();
        let mut job = ImportJob::new(sample_meta(), Box::new(mine));
        let self_id: NodeId = "2222222222222222222222222222222222222222".parse().unwrap();
        let (collab, map) = fake_collaborators(self_id);
        let cfg = MigrationConfig::default();

        send_from_peer(&mut peer, SyncSlotsFrame::Ack);
        job.drive(0, &cfg, &collab);
        assert_eq!(job.state, ImportState::ReceivingSnapshot);

        send_from_peer(&mut peer, SyncSlotsFrame::SnapshotEof);
        job.drive(1, &cfg, &collab);
        assert_eq!(job.state, ImportState::WaitPaused);
        assert!(collab.key_space.any_slot_manually_importing());

        send_from_peer(&mut peer, SyncSlotsFrame::Paused);
        job.drive(2, &cfg, &collab);
        assert_eq!(job.state, ImportState::FailoverRequested);

        send_from_peer(&mut peer, SyncSlotsFrame::FailoverGranted);
        job.drive(3, &cfg, &collab);
        assert_eq!(job.state, ImportState::FailoverGranted);

        job.drive(4, &cfg, &collab);
        assert_eq!(job.state, ImportState::FinishedWaitingToCleanup);
        assert_eq!(map.slot_owner(1), Some(self_id));
        assert_eq!(map.epoch_bumps(), 1);

        job.drive(5, &cfg, &collab);
        assert_eq!(job.state, ImportState::Success);
        assert!(!collab.key_space.any_slot_manually_importing());
    }

    #[test]
    fn ack_is_never_sent_while_waiting_for_the_first_one() {
        let (mine, _peer) = duplex_pair();
        let job = ImportJob::new(sample_meta(), Box::new(mine));
        assert_eq!(job.state, ImportState::WaitAck);
        assert!(!job.ack_permitted());
    }

    #[test]
    fn report_oom_fails_the_job_and_clears_importing_markers() {
        let (mine, mut peer) = duplex_pair();
        let mut job = ImportJob::new(sample_meta(), Box::new(mine));
        let self_id: NodeId = "2222222222222222222222222222222222222222".parse().unwrap();
        let (collab, _map) = fake_collaborators(self_id);
        let cfg = MigrationConfig::default();

        send_from_peer(&mut peer, SyncSlotsFrame::Ack);
        job.drive(0, &cfg, &collab);
        send_from_peer(&mut peer, SyncSlotsFrame::SnapshotEof);
        job.drive(1, &cfg, &collab);
        assert!(collab.key_space.any_slot_manually_importing());

        job.report_oom(2, &collab);
        assert_eq!(job.state, ImportState::FinishedWaitingToCleanup, "oom defers to the cleanup side-visit before failing");

        job.drive(3, &cfg, &collab);
        assert_eq!(job.state, ImportState::Failed);
        assert!(job.meta.status_msg.contains("OOM"));
        assert!(!collab.key_space.any_slot_manually_importing());
        assert_eq!(collab.key_space.deleted_slots(), vec![(DB, 0), (DB, 1), (DB, 2)]);
    }

    #[test]
    fn demotion_to_replica_fails_the_job() {
        let (mine, _peer) = duplex_pair();
        let mut job = ImportJob::new(sample_meta(), Box::new(mine));
        let self_id: NodeId = "2222222222222222222222222222222222222222".parse().unwrap();
        let (collab, map) = fake_collaborators(self_id);
        map.demote_to_replica();
        let cfg = MigrationConfig::default();

        job.drive(0, &cfg, &collab);
        assert_eq!(job.state, ImportState::FinishedWaitingToCleanup);

        job.drive(1, &cfg, &collab);
        assert_eq!(job.state, ImportState::Failed);
        assert_eq!(job.meta.status_msg, JobError::DemotedToReplica.to_string());
    }

    #[test]
    fn ownership_drifting_to_a_third_node_fails_the_job() {
        let (mine, _peer) = duplex_pair();
        let mut job = ImportJob::new(sample_meta(), Box::new(mine));
        let self_id: NodeId = "2222222222222222222222222222222222222222".parse().unwrap();
        let (collab, map) = fake_collaborators(self_id);
        let stray: NodeId = "3333333333333333333333333333333333333333".parse().unwrap();
        map.set_owner(1, stray);
        let cfg = MigrationConfig::default();

        job.drive(0, &cfg, &collab);
        assert_eq!(job.state, ImportState::FinishedWaitingToCleanup);

        job.drive(1, &cfg, &collab);
        assert_eq!(job.state, ImportState::Failed);
        assert_eq!(job.meta.status_msg, JobError::OwnershipChangedAway.to_string());
    }

    #[test]
    fn being_claimed_by_self_before_takeover_fails_with_assigned_to_self() {
        let (mine, _peer) = duplex_pair();
        let mut job = ImportJob::new(sample_meta(), Box::new(mine));
        let self_id: NodeId = "2222222222222222222222222222222222222222".parse().unwrap();
        let (collab, map) = fake_collaborators(self_id);
        map.set_owner(1, self_id);
        let cfg = MigrationConfig::default();

        job.drive(0, &cfg, &collab);
        assert_eq!(job.state, ImportState::FinishedWaitingToCleanup);

        job.drive(1, &cfg, &collab);
        assert_eq!(job.state, ImportState::Failed);
        assert_eq!(job.meta.status_msg, JobError::AssignedToSelf.to_string());
    }

    #[test]
    fn unexpected_frame_fails_and_clears_importing_markers() {
        let (mine, mut peer) = duplex_pair();
        let mut job = ImportJob::new(sample_meta(), Box::new(mine));
        let self_id: NodeId = "2222222222222222222222222222222222222222".parse().unwrap();
        let (collab, _map) = fake_collaborators(self_id);
        let cfg = MigrationConfig::default();

        send_from_peer(&mut peer, SyncSlotsFrame::SnapshotEof);
        job.drive(0, &cfg, &collab);
        assert_eq!(job.state, ImportState::FinishedWaitingToCleanup);

        job.drive(1, &cfg, &collab);
        assert_eq!(job.state, ImportState::Failed);
        assert!(!collab.key_space.any_slot_manually_importing());
    }
}
