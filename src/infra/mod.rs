//! Infrastructure adapters and runtime bootstrap.

pub mod assets;
pub mod clipboard;
pub mod error;
pub mod telemetry;
