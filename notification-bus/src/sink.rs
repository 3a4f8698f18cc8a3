//! Notification sinks
//!
//! Producers call [`NotificationSink::notify`], which never blocks and never
//! fails. The production sink is [`ChannelSink`]: it hands the notification to
//! a bounded channel drained by a [`crate::Dispatcher`]. When the channel is
//! full or closed the notification is dropped and counted.

use crate::{metrics::NOTIFICATION_ENQUEUE_TOTAL, Notification};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Fire-and-forget notification target
pub trait NotificationSink: Send + Sync {
    /// Push a notification without waiting for delivery
    fn notify(&self, notification: Notification);
}

/// Sink backed by a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Notification>,
}

impl ChannelSink {
    /// Create a sink and the receiver the dispatcher drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        let event = notification.event.clone();

        match self.sender.try_send(notification) {
            Ok(()) => {
                NOTIFICATION_ENQUEUE_TOTAL
                    .with_label_values(&[&event, "queued"])
                    .inc();
            }
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(event = %dropped.event, "Notification channel full, dropping notification");
                NOTIFICATION_ENQUEUE_TOTAL
                    .with_label_values(&[&event, "dropped"])
                    .inc();
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                warn!(event = %dropped.event, "Notification channel closed, dropping notification");
                NOTIFICATION_ENQUEUE_TOTAL
                    .with_label_values(&[&event, "dropped"])
                    .inc();
            }
        }
    }
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, notification: Notification) {
        debug!(event = %notification.event, "Notification discarded");
    }
}

/// Sink that records notifications in memory
#[derive(Debug, Clone, Default)]
pub struct CapturingSink {
    captured: Arc<Mutex<Vec<Notification>>>,
}

impl CapturingSink {
    /// Create empty capturing sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything captured so far
    pub fn captured(&self) -> Vec<Notification> {
        self.captured.lock().clone()
    }

    /// Event names in capture order
    pub fn events(&self) -> Vec<String> {
        self.captured.lock().iter().map(|n| n.event.clone()).collect()
    }

    /// Number of captured notifications with the given event name
    pub fn count(&self, event: &str) -> usize {
        self.captured.lock().iter().filter(|n| n.event == event).count()
    }

    /// Drop everything captured so far
    pub fn clear(&self) {
        self.captured.lock().clear();
    }
}

impl NotificationSink for CapturingSink {
    fn notify(&self, notification: Notification) {
        self.captured.lock().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_sink_delivers_to_receiver() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.notify(Notification::new("test", "ping", json!({})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, "ping");
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.notify(Notification::new("test", "first", json!({})));
        // Second push must not block even though nobody is draining
        sink.notify(Notification::new("test", "second", json!({})));

        assert_eq!(rx.recv().await.unwrap().event, "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new(2);
        drop(rx);
        sink.notify(Notification::new("test", "orphan", json!({})));
    }

    #[test]
    fn test_capturing_sink() {
        let sink = CapturingSink::new();
        sink.notify(Notification::new("test", "a", json!({})));
        sink.notify(Notification::new("test", "b", json!({})));
        sink.notify(Notification::new("test", "a", json!({})));

        assert_eq!(sink.events(), vec!["a", "b", "a"]);
        assert_eq!(sink.count("a"), 2);

        sink.clear();
        assert!(sink.captured().is_empty());
    }
}
