//! `slotstore-server` — the slot migration protocol: the dual
//! export/import state machines, the control-channel wire codec, the
//! per-tick supervisor, and the operator-facing admin surface built on top
//! of [`slotstore_core`]'s VSET and slot-range model.

pub mod cluster;
pub mod config;
pub mod error;

pub use cluster::admin::{AdminCommand, AdminDispatcher, AdminReply};
pub use cluster::net_session::TcpSession;
pub use cluster::prod_collab::{
    ChannelReplicationFeeder, ImmediateSnapshotProducer, InProcessClusterMap, MarkerKeySpace,
    SharedPauseFacility,
};
pub use cluster::supervisor::MigrationSupervisor;
pub use cluster::types::{ExportJob, ExportState, ImportJob, ImportState, JobKind, JobMeta, MigrationJob};
pub use config::MigrationConfig;
pub use error::{AdminError, JobError};
