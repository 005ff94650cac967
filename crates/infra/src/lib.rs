//! Infrastructure layer: job engine, remote API client, stores and connectors.
//!
//! The host process builds one [`Engine`] from an [`EngineConfig`] and a set of
//! [`Stores`]; everything else hangs off it.

pub mod config;
pub mod connectors;
pub mod engine;
pub mod http;
pub mod jobs;
pub mod scheduler;
pub mod stores;

pub use config::{ConfigError, EngineConfig, FailurePolicy, HttpConfig, OAuthClientConfig};
pub use engine::{Engine, EngineError, Stores};
pub use scheduler::{PollScheduler, SchedulerStatus};
