//! patchflow: turns generated change descriptions into validated, ordered
//! file operations, applies them through an external tool, plans
//! remediation for failures, and streams lifecycle events to live
//! subscribers.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod hub;
pub mod patch;

pub use error::{PatchError, Result};
