//! Social Markets Library
//!
//! Community prediction markets with wallet sign-in, AI-assisted market
//! drafting and automatic resolution driven by X (Twitter) activity:
//!
//! 1. **Markets**: 2-4 option questions that wallets stake on; display
//!    percentages always add up to 100.
//!
//! 2. **X monitoring**: markets whose titles mention X accounts are tracked.
//!    A polling worker reads new posts, evaluates the market's condition and
//!    resolves the market exactly once when it fires.

pub mod api;
pub mod config;
pub mod db;
pub mod services;
pub mod types;
pub mod wallet;

pub use config::Config;
pub use db::Database;
pub use services::{MarketDrafter, TrackingRegistrar, XClient, XMonitor};
pub use types::{Market, MarketEvent, MarketOption, MarketStatus, Prediction, Proposal};
