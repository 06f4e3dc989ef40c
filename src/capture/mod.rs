// ABOUTME: Write interception for the source database
// ABOUTME: CdcConnection wraps rusqlite and records audit rows in the same transaction

pub mod connection;
pub mod sql;

pub use connection::CdcConnection;
