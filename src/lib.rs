//! Client-side rate-limit tracking for the BullBearDays chart analysis backend.
//!
//! [`RateLimitTracker`] keeps one usage window per named endpoint,
//! [`spawn_sweeper`] rolls expired windows over in the background, and
//! [`AnalysisClient`] drives both around real HTTP calls.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod sweep;
pub mod tracker;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, EndpointConfig, LimitsConfig};
pub use error::{Error, Result};
pub use http::AnalysisClient;
pub use sweep::{spawn_sweeper, SweepHandle, DEFAULT_SWEEP_PERIOD};
pub use tracker::{lock_tracker, EndpointLimit, RateLimitTracker, SharedTracker};
