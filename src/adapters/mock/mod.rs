//! Test doubles for the archive and dispatcher ports.

pub mod archive;
pub mod dispatcher;

pub use archive::MockArchive;
pub use dispatcher::MockDispatcher;
