//! # realm-core
//!
//! Core types shared by the realm directory access layer.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy, protocol result code translation and error responses
//! - [`config`] - Realm configuration (directory URI, base DN, host, timeouts, SSF)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::RealmConfig;
pub use error::{Error, Result};
