//! Background notification dispatcher with retry logic

use crate::{
    metrics::{NOTIFICATION_DELIVERY_DURATION, NOTIFICATION_DELIVERY_TOTAL},
    Error, Notification, Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delivery transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a single notification
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Transport that POSTs JSON to a monitoring endpoint
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create transport for the given endpoint URL
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(notification.to_bytes()?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Delivery(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Max delivery attempts per notification
    pub max_retry_attempts: u32,

    /// Initial retry delay
    pub initial_retry_delay: Duration,

    /// Max retry delay
    pub max_retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Drains a [`crate::ChannelSink`] receiver and delivers each notification.
///
/// Failures are logged and swallowed; the dispatcher never reports back to
/// the producer.
pub struct Dispatcher {
    receiver: mpsc::Receiver<Notification>,
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create new dispatcher
    pub fn new(
        receiver: mpsc::Receiver<Notification>,
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            receiver,
            transport,
            config,
        }
    }

    /// Run on a dedicated task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Delivery loop; exits once every sender has been dropped
    pub async fn run(mut self) {
        info!("Notification dispatcher started");

        while let Some(notification) = self.receiver.recv().await {
            self.deliver(&notification).await;
        }

        info!("Notification dispatcher stopped");
    }

    async fn deliver(&self, notification: &Notification) {
        let start = Instant::now();
        let result = self.deliver_with_retry(notification).await;

        NOTIFICATION_DELIVERY_DURATION
            .with_label_values(&[&notification.event])
            .observe(start.elapsed().as_secs_f64());

        let status = match result {
            Ok(()) => "success",
            Err(e) => {
                warn!(
                    notification_id = %notification.id,
                    event = %notification.event,
                    "Notification delivery failed: {}",
                    e
                );
                "error"
            }
        };
        NOTIFICATION_DELIVERY_TOTAL
            .with_label_values(&[&notification.event, status])
            .inc();
    }

    /// Deliver with exponential backoff retry
    async fn deliver_with_retry(&self, notification: &Notification) -> Result<()> {
        let mut attempts = 0;
        let mut delay = self.config.initial_retry_delay;

        loop {
            attempts += 1;

            match self.transport.deliver(notification).await {
                Ok(()) => {
                    if attempts > 1 {
                        debug!("Notification delivered after {} attempts", attempts);
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempts >= self.config.max_retry_attempts {
                        return Err(e);
                    }

                    debug!(
                        "Delivery failed (attempt {}), retrying in {:?}: {}",
                        attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;

                    delay = (delay * 2).min(self.config.max_retry_delay);
                }
            }
        }
    }
}
