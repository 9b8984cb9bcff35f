//! Imaging archive adapters.

pub mod orthanc;

pub use orthanc::OrthancClient;
