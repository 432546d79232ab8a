//! Database module: the durable job record store.
//!
//! `repo` holds SQL-only functions that map rows into domain entities from
//! `crate::model`. The claim/lease protocol lives here because its guarantee
//! (no double-claim across processes) has to live in the store's conditional
//! update semantics, not in process memory.
//!
//! External modules should import from `notion_mirror::db` — the repository
//! API is re-exported for convenience.

pub mod repo;

pub use repo::*;
