pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod service;
pub mod telemetry;

pub use error::{Error, ErrorKind, Result};
