//! The slot migration protocol (§4): wire framing, collaborator
//! contracts, the dual export/import job model, their drivers, the
//! per-tick supervisor, and the operator-facing admin surface.

pub mod admin;
pub mod collab;
pub mod export_fsm;
pub mod import_fsm;
pub mod net_session;
pub mod prod_collab;
pub mod supervisor;
pub mod types;
pub mod wire;
