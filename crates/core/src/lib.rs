//! `tidemark-core`: shared building blocks for the sync engine.
//!
//! This crate contains **pure** primitives (no IO, no async): identifiers,
//! the job state machine, connector keys and timestamp handling shared by every other crate.

pub mod connector;
pub mod error;
pub mod id;
pub mod job;
pub mod time;

pub use connector::ConnectorKey;
pub use error::{CoreError, CoreResult};
pub use id::{AccountId, JobId};
pub use job::{JobStatus, LogLevel};
