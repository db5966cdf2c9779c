//! The export (source-side) driver (§4.4): one synchronous step per call,
//! no blocking, no `.await` -- readiness is communicated back to the
//! supervisor purely through `self.state` after the call returns.

use crate::cluster::collab::{Collaborators, PausePurpose, SnapshotStartError, SnapshotStatus};
use crate::cluster::types::{ExportJob, ExportState};
use crate::cluster::wire::{self, RespReply, SyncSlotsFrame};
use crate::config::MigrationConfig;
use crate::error::JobError;
use tokio_util::codec::Decoder;

impl ExportJob {
    /// Advances this job by one tick. Collaborator calls (pause, snapshot,
    /// replication registration) are made directly; errors are folded into
    /// `self.state`/`self.meta.status_msg`, never returned, so a single bad
    /// job can't abort the supervisor's loop over the rest.
    pub fn drive(&mut self, now: i64, cfg: &MigrationConfig, collab: &Collaborators) {
        if self.state.is_terminal() {
            return;
        }

        if self.timed_out_on_interaction(now, cfg) {
            self.fail_with(now, JobError::InteractionTimeout);
            collab.pause_facility.unpause(PausePurpose::SlotMigration);
            return;
        }

        if let Some(deadline) = self.pause_deadline_ms {
            if now > deadline {
                if matches!(self.state, ExportState::FailoverGranted) {
                    tracing::warn!(job = %self.meta.name, "Write loss risk!");
                    self.fail_with(now, JobError::WriteLossRisk);
                } else {
                    self.fail_with(now, JobError::PauseTimeoutBeforeStreaming);
                }
                collab.pause_facility.unpause(PausePurpose::SlotMigration);
                return;
            }
        }

        let result = match self.state {
            ExportState::Connect => self.drive_connect(),
            ExportState::SendAuth | ExportState::ReadAuth => self.drive_auth(),
            ExportState::SendEstablish => self.drive_send_establish(collab),
            ExportState::ReadEstablish => self.drive_read_establish(now),
            ExportState::WaitSnapshot => self.drive_wait_snapshot(collab),
            ExportState::Snapshotting => self.drive_snapshotting(collab),
            ExportState::Streaming => self.drive_streaming(now, cfg, collab),
            ExportState::WaitPause => self.drive_wait_pause(now, cfg, collab),
            ExportState::FailoverPaused => self.drive_failover_paused(now, cfg, collab),
            ExportState::FailoverGranted => self.drive_failover_granted(now, collab),
            ExportState::Success | ExportState::Failed | ExportState::Cancelled => Ok(()),
        };

        if let Err(err) = result {
            self.fail_with(now, err);
            collab.pause_facility.unpause(PausePurpose::SlotMigration);
            metrics::counter!("slotstore_migration_export_failed_total").increment(1);
        } else {
            self.meta.touch(now);
            if self.state == ExportState::Success {
                metrics::counter!("slotstore_migration_export_success_total").increment(1);
            }
        }
    }

    fn timed_out_on_interaction(&self, now: i64, cfg: &MigrationConfig) -> bool {
        !matches!(self.state, ExportState::FailoverGranted)
            && now - self.meta.last_update_ms > cfg.replication_timeout_ms
    }

    fn drive_connect(&mut self) -> Result<(), JobError> {
        match self.session.try_connect() {
            Ok(true) => {
                self.state = ExportState::SendAuth;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(_) => Err(JobError::ConnectionLost),
        }
    }

    fn drive_auth(&mut self) -> Result<(), JobError> {
        match self.session.authenticate() {
            Ok(true) => {
                self.state = ExportState::SendEstablish;
                Ok(())
            }
            Ok(false) => {
                self.state = ExportState::ReadAuth;
                Ok(())
            }
            Err(_) => Err(JobError::AuthFailed("connection lost during AUTH".into())),
        }
    }

    fn drive_send_establish(&mut self, collab: &Collaborators) -> Result<(), JobError> {
        if self.send_buf.is_empty() {
            let frame = SyncSlotsFrame::Establish {
                source: collab.cluster_map.self_id(),
                name: self.meta.name,
                ranges: self.meta.ranges.clone(),
            };
            wire::enqueue(&mut self.codec, &mut self.send_buf, frame)
                .map_err(|e| JobError::EstablishFailed(e.to_string()))?;
        }
        wire::pump_write(&mut *self.session, &mut self.send_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        if self.send_buf.is_empty() {
            self.state = ExportState::ReadEstablish;
        }
        Ok(())
    }

    fn drive_read_establish(&mut self, now: i64) -> Result<(), JobError> {
        wire::pump_read(&mut *self.session, &mut self.recv_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        let Some(frame) = self
            .codec
            .decode(&mut self.recv_buf)
            .map_err(|e| JobError::EstablishFailed(e.to_string()))?
        else {
            return Ok(());
        };
        match frame {
            SyncSlotsFrame::Reply(RespReply::Ok) => {
                // A courtesy liveness heartbeat: the target's `WAIT_ACK`
                // step waits for exactly this before it starts expecting
                // snapshot framing.
                wire::enqueue(&mut self.codec, &mut self.send_buf, SyncSlotsFrame::Ack)
                    .map_err(|e| JobError::EstablishFailed(e.to_string()))?;
                self.last_ack_sent_ms = Some(now);
                self.state = ExportState::WaitSnapshot;
                Ok(())
            }
            SyncSlotsFrame::Reply(RespReply::Err(msg)) => Err(JobError::EstablishFailed(msg)),
            _ => Err(JobError::UnknownSubcommand),
        }
    }

    /// SNAPSHOTTING is only entered once the send buffer left over from
    /// ESTABLISH/the courtesy ACK has fully drained and the snapshot
    /// producer confirms no other snapshot is running process-wide (§4.4);
    /// either condition failing just means waiting another tick, not a
    /// failure.
    fn drive_wait_snapshot(&mut self, collab: &Collaborators) -> Result<(), JobError> {
        wire::pump_write(&mut *self.session, &mut self.send_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        if !self.send_buf.is_empty() {
            return Ok(());
        }
        match collab.snapshot_producer.start_snapshot(&self.meta.ranges) {
            Ok(handle) => {
                self.snapshot = Some(handle);
                self.state = ExportState::Snapshotting;
                Ok(())
            }
            Err(SnapshotStartError::Busy) => Ok(()),
            Err(SnapshotStartError::Failed(msg)) => Err(JobError::SnapshotFailed(msg)),
        }
    }

    fn drive_snapshotting(&mut self, collab: &Collaborators) -> Result<(), JobError> {
        let Some(handle) = self.snapshot.as_mut() else {
            return Err(JobError::SnapshotFailed("no snapshot in progress".into()));
        };
        match handle.poll() {
            SnapshotStatus::Running => Ok(()),
            SnapshotStatus::Done => {
                collab
                    .replication_feeder
                    .register(self.meta.name, self.meta.ranges.clone());
                wire::enqueue(&mut self.codec, &mut self.send_buf, SyncSlotsFrame::SnapshotEof)
                    .map_err(|e| JobError::SnapshotFailed(e.to_string()))?;
                self.snapshot = None;
                self.state = ExportState::Streaming;
                Ok(())
            }
            SnapshotStatus::Failed(msg) => Err(JobError::SnapshotFailed(msg)),
        }
    }

    fn drive_streaming(
        &mut self,
        now: i64,
        cfg: &MigrationConfig,
        collab: &Collaborators,
    ) -> Result<(), JobError> {
        wire::pump_write(&mut *self.session, &mut self.send_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        wire::pump_read(&mut *self.session, &mut self.recv_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        while let Some(frame) = self
            .codec
            .decode(&mut self.recv_buf)
            .map_err(|_| JobError::UnexpectedTransition)?
        {
            match frame {
                SyncSlotsFrame::Ack => self.meta.record_ack(now),
                SyncSlotsFrame::RequestPause => {
                    if self.backlog_over_cap(cfg) {
                        self.state = ExportState::WaitPause;
                    } else {
                        self.accept_pause(now, cfg, collab)?;
                    }
                    return Ok(());
                }
                _ => return Err(JobError::UnexpectedTransition),
            }
        }
        Ok(())
    }

    /// §7 resource-exhaustion policy: a pause is denied while the client
    /// output buffer towards the target exceeds
    /// `slot_migration_max_failover_repl_bytes` (negative = unlimited), and
    /// retried from `WAIT_PAUSE` until it drains or the job times out.
    fn backlog_over_cap(&self, cfg: &MigrationConfig) -> bool {
        cfg.max_failover_repl_bytes >= 0
            && self.session.buffered_bytes() as i64 > cfg.max_failover_repl_bytes
    }

    fn accept_pause(&mut self, now: i64, cfg: &MigrationConfig, collab: &Collaborators) -> Result<(), JobError> {
        let deadline = cfg.initial_pause_deadline(now);
        self.pause_deadline_ms = Some(deadline);
        collab.pause_facility.pause(PausePurpose::SlotMigration, deadline);
        wire::enqueue(&mut self.codec, &mut self.send_buf, SyncSlotsFrame::Paused)
            .map_err(|e| JobError::EstablishFailed(e.to_string()))?;
        self.state = ExportState::FailoverPaused;
        Ok(())
    }

    fn drive_wait_pause(
        &mut self,
        now: i64,
        cfg: &MigrationConfig,
        collab: &Collaborators,
    ) -> Result<(), JobError> {
        wire::pump_write(&mut *self.session, &mut self.send_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        if !self.backlog_over_cap(cfg) {
            self.accept_pause(now, cfg, collab)?;
        }
        Ok(())
    }

    fn drive_failover_paused(
        &mut self,
        now: i64,
        cfg: &MigrationConfig,
        collab: &Collaborators,
    ) -> Result<(), JobError> {
        wire::pump_write(&mut *self.session, &mut self.send_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        wire::pump_read(&mut *self.session, &mut self.recv_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        let Some(frame) = self
            .codec
            .decode(&mut self.recv_buf)
            .map_err(|_| JobError::UnexpectedTransition)?
        else {
            return Ok(());
        };
        match frame {
            SyncSlotsFrame::RequestFailover => {
                let extended = cfg.failover_pause_deadline(now);
                let existing = self.pause_deadline_ms.unwrap_or(extended).max(extended);
                self.pause_deadline_ms = Some(existing);
                collab
                    .pause_facility
                    .pause(PausePurpose::SlotMigration, existing);
                wire::enqueue(
                    &mut self.codec,
                    &mut self.send_buf,
                    SyncSlotsFrame::FailoverGranted,
                )
                .map_err(|e| JobError::EstablishFailed(e.to_string()))?;
                self.state = ExportState::FailoverGranted;
                Ok(())
            }
            _ => Err(JobError::UnexpectedTransition),
        }
    }

    /// The topology-change hook's EXPORT half (§4.7), polled here each tick
    /// rather than pushed from the cluster map: once failover has been
    /// granted, this is the only state where ownership of the job's ranges
    /// is still expected to move, so every other state trusts its own
    /// stream of control-channel frames instead of polling the map.
    fn drive_failover_granted(&mut self, now: i64, collab: &Collaborators) -> Result<(), JobError> {
        wire::pump_write(&mut *self.session, &mut self.send_buf)
            .map_err(|_| JobError::ConnectionLost)?;
        if !self.send_buf.is_empty() {
            return Ok(());
        }
        let self_id = collab.cluster_map.self_id();
        let target = self.meta.peer_node_id;
        let mut all_claimed_by_target = true;
        let mut drifted = false;
        for slot in self.meta.ranges.ranges().iter().flat_map(|r| r.start()..=r.end()) {
            match collab.cluster_map.slot_owner(slot) {
                Some(owner) if owner == target => {}
                Some(owner) if owner == self_id => all_claimed_by_target = false,
                _ => {
                    all_claimed_by_target = false;
                    drifted = true;
                }
            }
        }
        if all_claimed_by_target {
            collab.replication_feeder.unregister(self.meta.name);
            collab.pause_facility.unpause(PausePurpose::SlotMigration);
            self.pause_deadline_ms = None;
            self.state = ExportState::Success;
            self.meta.touch(now);
        } else if drifted {
            return Err(JobError::OwnershipChangedAway);
        }
        Ok(())
    }
}
