//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: input records and row views exchanged with repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `tg_communicator::db`; we re-export the
//! repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ChannelRecord, NewNotification, RecordedOutcome, TeamRecord, UserRecord};
