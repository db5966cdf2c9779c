//! Error taxonomy for the migration core.
//!
//! Leaf functions return `Result<T, JobError>` / `Result<T, AdminError>`.
//! Per the error handling design, a [`JobError`] never escapes the
//! supervisor's `tick()` as an `Err` — it is converted into the job's
//! terminal state and `status_msg` instead. Terminal states never
//! "unterminal".

use slotstore_core::{IdParseError, SlotRangeParseError};
use thiserror::Error;

/// Every way a migration job can terminate with something other than
/// success, plus the protocol-violation cases recognised on the control
/// channel. The `Display` text is the operator/log-facing message for each
/// case.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Unexpected state machine transition")]
    UnexpectedTransition,

    #[error("Unknown SYNCSLOTS subcommand used")]
    UnknownSubcommand,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("AUTH failed: {0}")]
    AuthFailed(String),

    #[error("ESTABLISH failed: {0}")]
    EstablishFailed(String),

    #[error("Snapshot child process failed: {0}")]
    SnapshotFailed(String),

    #[error("Ran out of memory (OOM) during slot import")]
    OutOfMemory,

    #[error("unexpectedly assigned to myself")]
    AssignedToSelf,

    #[error("Data was flushed")]
    DataFlushed,

    #[error("demoted to replica")]
    DemotedToReplica,

    #[error("Timed out after too long with no interaction")]
    InteractionTimeout,

    #[error("Timed out before streaming completed")]
    PauseTimeoutBeforeStreaming,

    #[error("Unpaused before migration completed (write loss risk!)")]
    WriteLossRisk,

    #[error("slot ownership changed away from this node")]
    OwnershipChangedAway,

    #[error("operator requested cancellation")]
    Cancelled,
}

/// Errors from the operator-facing administrative surface (`MIGRATESLOTS`,
/// `CANCELSLOTMIGRATIONS`, `GETSLOTMIGRATIONS`) and the `ESTABLISH`
/// preconditions of the control channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    #[error(transparent)]
    SlotRange(#[from] SlotRangeParseError),

    #[error(transparent)]
    Id(#[from] IdParseError),

    #[error("Target node is not a primary")]
    TargetNotPrimary,

    #[error("Source node is target node itself")]
    SourceIsTarget,

    #[error("Slots are not served by this node.")]
    SlotsNotOwned,

    #[error("Requested slots span multiple shards")]
    SpansMultipleShards,

    #[error("I am already migrating slot {0}.")]
    AlreadyMigrating(u16),

    #[error("Unknown node name: {0}")]
    UnknownNode(String),

    #[error("a manual import or migration is already in progress for these slots")]
    ImportInProgress,

    #[error("malformed MIGRATESLOTS command: {0}")]
    Syntax(String),
}
