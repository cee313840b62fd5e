//! # TaskPing Core
//!
//! Shared data model, collaborator traits, errors, and configuration for the
//! TaskPing notification delivery engine. No I/O lives here — persistence,
//! transport, and rendering are trait seams implemented elsewhere.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{BatchConfig, EngineConfig, QueueConfig, RetryConfig};
pub use error::{Result, TaskPingError};
pub use traits::{ChannelClient, Payload, PayloadRenderer, SendReceipt, Store};
pub use types::{
    AnalyticsEvent, BatchEntry, DeliveryStatus, DigestFrequency, DigestPeriod, DigestWork,
    NotificationEvent, NotificationPrefs, NotificationRecord, NotificationType, Priority,
    PriorityFloor, QuietHours, RecipientProfile, SuppressReason, WorkItem, WorkspaceConfig,
    WorkspaceHealth,
};
