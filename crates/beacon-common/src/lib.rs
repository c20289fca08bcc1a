//! # Beacon Common
//!
//! Shared types, errors, and constants used across Beacon components.
//!
//! ## Modules
//! - `types` - etcd wire model (KeyEvent, Node) and liveness vocabulary
//! - `error` - Store and component error types
//! - `constants` - Key roots, defaults, and etcd error codes

pub mod constants;
pub mod error;
pub mod types;

pub use error::{BeaconError, StoreError};
pub use types::*;
