//! Live notifications for observers (UI panels, log tails, tests).
//!
//! The bus is for distribution only: job rows and job events in the job store are
//! the source of truth, notifications merely mirror them to whoever is listening.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;
pub mod notifier;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{BusError, InMemoryEventBus};
pub use notification::Notification;
pub use notifier::Notifier;
