//! `jobwright-core` — shared building blocks.
//!
//! Identifiers and the validation error model used by every other crate.
//! No IO, no runtime.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{EventId, RunId, TenantKey};
