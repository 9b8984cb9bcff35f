//! Worker dispatch adapters.

pub mod container;

pub use container::{ContainerDispatcher, WORKER_IMAGES_DIR};
