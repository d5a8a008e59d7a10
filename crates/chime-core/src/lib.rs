//! `chime-core` — configuration and shared error type for the chime workspace.

pub mod config;
pub mod error;

pub use config::ChimeConfig;
pub use error::{ChimeError, Result};
