//! Background services and external adapters

pub mod ai_drafts;
pub mod conditions;
pub mod expiring_store;
pub mod resolution;
pub mod x_client;
pub mod x_errors;
pub mod x_monitor;
pub mod x_oauth;
pub mod x_tracking;

pub use ai_drafts::{Category, DraftProvider, MarketDraft, MarketDrafter, OpenAiProvider, RawDraft};
pub use conditions::{Condition, Evaluation};
pub use expiring_store::{ExpiringStore, MemoryStore};
pub use resolution::{affirmative_option, apply_resolution, ResolutionOutcome};
pub use x_client::{PostPage, SocialReader, XClient};
pub use x_errors::XApiError;
pub use x_monitor::{Clock, CycleOutcome, CycleReport, MonitorHandle, MonitorStatus, SchedulerState, SystemClock, XMonitor};
pub use x_oauth::PendingLink;
pub use x_tracking::{Registration, TrackingRegistrar};
