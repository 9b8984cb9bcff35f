//! CLI command implementations.

pub mod experiment;
pub mod init;
pub mod model;
pub mod run;
pub mod status;
pub mod tick;
