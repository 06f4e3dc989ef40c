// ABOUTME: Command implementations behind the CLI subcommands
// ABOUTME: Exports validate, sync, status, and reset

pub mod reset;
pub mod status;
pub mod sync;
pub mod validate;

pub use reset::reset;
pub use status::status;
pub use sync::{sync, SyncMode};
pub use validate::validate;
