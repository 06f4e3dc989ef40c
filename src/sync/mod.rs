// ABOUTME: Sync orchestration: baseline backfill and the incremental engine
// ABOUTME: InitialSync copies pre-existing rows; SyncEngine drives the full lifecycle

pub mod engine;
pub mod initial;

pub use engine::SyncEngine;
pub use initial::InitialSync;
