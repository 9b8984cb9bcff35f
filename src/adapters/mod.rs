//! Infrastructure adapters for external systems.

pub mod archive;
pub mod bus;
pub mod dispatch;
pub mod mock;
pub mod sqlite;
