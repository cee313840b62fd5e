//! taskping-engine — notification delivery for chat workspaces.
//!
//! The flow from domain event to chat message:
//!
//! ```text
//! NotificationEvent
//!     │  eligibility (prefs, quiet hours, priority floor)
//!     ├── deny ──────────► suppressed record
//!     ├── batch ─────────► BatchAccumulator ──► composite message
//!     └── immediate ─────► WorkQueues ──► ChannelGuard ──► ChannelClient
//! ```
//!
//! [`engine::NotificationEngine`] is the façade; everything underneath is
//! injected through the `taskping-core` traits.

pub mod batch;
pub mod digest;
pub mod eligibility;
pub mod engine;
pub mod guard;
pub mod memory;
pub mod queue;

#[cfg(test)]
pub(crate) mod testkit;

pub use batch::BatchAccumulator;
pub use digest::DigestAggregator;
pub use eligibility::{Decision, evaluate};
pub use engine::{NotificationEngine, SubmitReport};
pub use guard::ChannelGuard;
pub use memory::MemoryStore;
pub use queue::{JobCategory, QueueBackend, QueueStats, WorkQueues};
