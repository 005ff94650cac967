//! Background job system.
//!
//! ## Design
//!
//! - Jobs are typed by a routing key (`connector.jira.sync`, `job.simulate`, ...)
//! - Lifecycle: `queued → running → {succeeded, failed, canceled}`, terminal states final
//! - Bounded worker pool, FIFO dispatch
//! - Cooperative cancellation observed at handler checkpoints
//!
//! ## Components
//!
//! - `Job`: job row with payload, progress and outcome
//! - `JobStore`: persistence for jobs and their audit trail
//! - `JobQueue`: FIFO + worker pool dispatching to registered handlers
//! - `JobHandler`: the unit of work bound to a job type

pub mod handler;
pub mod queue;
pub mod simulate;
pub mod store;
pub mod types;

pub use handler::{CancellationToken, HandlerError, JobContext, JobHandler, handler_fn};
pub use queue::{JobQueue, QueueSnapshot};
pub use simulate::{SIMULATE_JOB_TYPE, SimulateHandler};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{Job, JobEvent, JobFailure, JobUpdate, JsonMap};
