//! Notification bus for the cash closing core
//!
//! Provides fire-and-forget event delivery to a monitoring endpoint:
//! - `NotificationSink` trait consumed by the closing core
//! - Bounded channel hand-off so producers never wait on delivery
//! - Background dispatcher with retry and exponential backoff
//! - No-op and capturing sinks for tests
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod notification;
pub mod sink;

pub use dispatcher::{Dispatcher, DispatcherConfig, HttpTransport, Transport};
pub use error::{Error, Result};
pub use notification::Notification;
pub use sink::{CapturingSink, ChannelSink, NoopSink, NotificationSink};
