//! The operator-facing administrative surface: `MIGRATESLOTS`,
//! `CANCELSLOTMIGRATIONS`, `GETSLOTMIGRATIONS` (§6, §7). Parsing is kept
//! separate from dispatch so the wire layer (whatever speaks real RESP to
//! clients) only has to hand this module a token list.

use std::future::{ready, Ready};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use slotstore_core::{MigrationJobName, NodeId, SlotRangeList};
use tower::Service;

use crate::cluster::collab::{ClusterMap, Session};
use crate::cluster::supervisor::MigrationSupervisor;
use crate::cluster::types::{ExportJob, JobKind, JobMeta, MigrationJob};
use crate::error::AdminError;

/// A parsed administrative request, independent of the RESP argv it came
/// from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    MigrateSlots {
        target: NodeId,
        ranges: SlotRangeList,
    },
    CancelSlotMigrations {
        job: Option<MigrationJobName>,
    },
    GetSlotMigrations,
}

impl AdminCommand {
    /// Parses `MIGRATESLOTS TARGET <node-id> SLOTSRANGE <start> <end>...`,
    /// `CANCELSLOTMIGRATIONS [<job-name>]`, or `GETSLOTMIGRATIONS` from
    /// already-tokenised argv (case-insensitive verbs, per RESP command
    /// convention).
    pub fn parse(tokens: &[&str]) -> Result<Self, AdminError> {
        let Some((verb, rest)) = tokens.split_first() else {
            return Err(AdminError::Syntax("empty command".into()));
        };
        match verb.to_ascii_uppercase().as_str() {
            "MIGRATESLOTS" => Self::parse_migrate_slots(rest),
            "CANCELSLOTMIGRATIONS" => Self::parse_cancel(rest),
            "GETSLOTMIGRATIONS" => {
                if rest.is_empty() {
                    Ok(Self::GetSlotMigrations)
                } else {
                    Err(AdminError::Syntax(
                        "GETSLOTMIGRATIONS takes no arguments".into(),
                    ))
                }
            }
            other => Err(AdminError::Syntax(format!("unknown verb {other}"))),
        }
    }

    fn parse_migrate_slots(tokens: &[&str]) -> Result<Self, AdminError> {
        if tokens.len() < 4 || !tokens[0].eq_ignore_ascii_case("TARGET") {
            return Err(AdminError::Syntax(
                "expected MIGRATESLOTS TARGET <node-id> SLOTSRANGE <start> <end> ...".into(),
            ));
        }
        let target: NodeId = tokens[1].parse()?;
        if !tokens[2].eq_ignore_ascii_case("SLOTSRANGE") {
            return Err(AdminError::Syntax("expected SLOTSRANGE".into()));
        }
        let ranges = SlotRangeList::parse(&tokens[3..])?;
        Ok(Self::MigrateSlots { target, ranges })
    }

    fn parse_cancel(tokens: &[&str]) -> Result<Self, AdminError> {
        match tokens {
            [] => Ok(Self::CancelSlotMigrations { job: None }),
            [name] => {
                let job: MigrationJobName = name.parse()?;
                Ok(Self::CancelSlotMigrations { job: Some(job) })
            }
            _ => Err(AdminError::Syntax(
                "CANCELSLOTMIGRATIONS takes at most one job name".into(),
            )),
        }
    }
}

/// A textual reply, already formatted the way the operator-facing
/// connection writes it back (the final RESP encoding of that text is the
/// generic client-facing wire layer's job, not this surface's).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminReply {
    Ok(String),
    Err(String),
}

/// Routes parsed [`AdminCommand`]s to the supervisor. Implements
/// [`tower::Service`] so it composes with the same middleware stack
/// (timeouts, concurrency limits, logging layers) any other tower service
/// in this process does.
pub struct AdminDispatcher {
    supervisor: Arc<Mutex<MigrationSupervisor>>,
    cluster_map: Arc<dyn ClusterMap>,
    now_ms: Arc<dyn Fn() -> i64 + Send + Sync>,
    /// How to open a fresh control-channel session to a migration target.
    /// Production wires this to a real TCP connector; tests substitute an
    /// in-memory duplex pipe.
    session_factory: Arc<dyn Fn(NodeId) -> Result<Box<dyn Session>, AdminError> + Send + Sync>,
}

impl AdminDispatcher {
    #[must_use]
    pub fn new(
        supervisor: Arc<Mutex<MigrationSupervisor>>,
        cluster_map: Arc<dyn ClusterMap>,
        now_ms: Arc<dyn Fn() -> i64 + Send + Sync>,
        session_factory: Arc<dyn Fn(NodeId) -> Result<Box<dyn Session>, AdminError> + Send + Sync>,
    ) -> Self {
        Self {
            supervisor,
            cluster_map,
            now_ms,
            session_factory,
        }
    }

    /// Handles one parsed command synchronously. The [`Service`] impl below
    /// exists so this dispatcher composes with tower middleware; direct
    /// callers that don't need that (the admin TCP listener, tests) can
    /// call this inherent method instead of going through `poll_ready`/`call`.
    pub fn handle(&self, cmd: AdminCommand) -> AdminReply {
        match cmd {
            AdminCommand::MigrateSlots { target, ranges } => self.migrate_slots(target, ranges),
            AdminCommand::CancelSlotMigrations { job } => self.cancel(job),
            AdminCommand::GetSlotMigrations => self.get_migrations(),
        }
    }

    fn migrate_slots(&self, target: NodeId, ranges: SlotRangeList) -> AdminReply {
        if target == self.cluster_map.self_id() {
            return AdminReply::Err(AdminError::SourceIsTarget.to_string());
        }
        if ranges.is_empty() {
            return AdminReply::Err(AdminError::Syntax("No slot ranges specified".into()).to_string());
        }
        for range in ranges.ranges() {
            for slot in range.start()..=range.end() {
                match self.cluster_map.slot_owner(slot) {
                    Some(owner) if owner == self.cluster_map.self_id() => {}
                    _ => return AdminReply::Err(AdminError::SlotsNotOwned.to_string()),
                }
            }
        }
        if let Err(err) = self.supervisor.lock().reject_if_already_migrating(&ranges) {
            return AdminReply::Err(err.to_string());
        }

        let mut name_bytes = [0u8; 20];
        rand::rng().fill_bytes(&mut name_bytes);
        let name = MigrationJobName::from_bytes(name_bytes);

        let session = match (self.session_factory)(target) {
            Ok(session) => session,
            Err(err) => return AdminReply::Err(err.to_string()),
        };

        let now = (self.now_ms)();
        let meta = JobMeta::new(name, target, ranges, now);
        let job = ExportJob::new(meta, session);
        self.supervisor.lock().add_export(job);
        AdminReply::Ok(format!("OK {name}"))
    }

    fn cancel(&self, job: Option<MigrationJobName>) -> AdminReply {
        let now = (self.now_ms)();
        let mut supervisor = self.supervisor.lock();
        match job {
            Some(name) => {
                if supervisor.cancel(name, now) {
                    AdminReply::Ok(format!("cancelled {name}"))
                } else {
                    AdminReply::Err(format!("no such migration job: {name}"))
                }
            }
            None => {
                let names: Vec<MigrationJobName> = supervisor
                    .list()
                    .filter(|job| !job.is_terminal())
                    .map(MigrationJob::name)
                    .collect();
                for name in &names {
                    supervisor.cancel(*name, now);
                }
                AdminReply::Ok(format!("cancelled {} job(s)", names.len()))
            }
        }
    }

    fn get_migrations(&self) -> AdminReply {
        let supervisor = self.supervisor.lock();
        let entries: Vec<MigrationStatusEntry> = supervisor
            .list()
            .map(|job| MigrationStatusEntry {
                job: job.name().to_string(),
                kind: match job.kind() {
                    JobKind::Export => "export",
                    JobKind::Import => "import",
                },
                peer: job.meta().peer_node_id.to_string(),
                status: job.status_msg().to_string(),
            })
            .collect();
        match serde_json::to_string(&entries) {
            Ok(body) => AdminReply::Ok(body),
            Err(err) => AdminReply::Err(format!("failed to encode migration status: {err}")),
        }
    }
}

/// One `GETSLOTMIGRATIONS` row, serialised to JSON so operator tooling can
/// parse the reply instead of scraping formatted text.
#[derive(Debug, Clone, serde::Serialize)]
struct MigrationStatusEntry {
    job: String,
    kind: &'static str,
    peer: String,
    status: String,
}

impl Service<AdminCommand> for AdminDispatcher {
    type Response = AdminReply;
    type Error = std::convert::Infallible;
    type Future = Ready<Result<AdminReply, std::convert::Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, cmd: AdminCommand) -> Self::Future {
        ready(Ok(self.handle(cmd)))
    }
}
