//! Log fan-out
//!
//! Tagged log lines from all deployments are broadcast to every live
//! subscriber. Publishing is fire-and-forget: no subscribers is not an
//! error, and a lagging subscriber drops lines rather than blocking the
//! publisher.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// A log line tagged with its deployment
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub deployment_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast hub for deployment log lines
#[derive(Debug)]
pub struct LogHub {
    tx: broadcast::Sender<LogLine>,
}

impl LogHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a line for a deployment. Never blocks, never fails.
    pub fn publish(&self, deployment_id: &str, text: impl Into<String>) {
        let line = LogLine {
            deployment_id: deployment_id.to_string(),
            text: text.into(),
            timestamp: Utc::now(),
        };
        debug!("[{}] {}", line.deployment_id, line.text);

        // Err only means nobody is listening right now
        let _ = self.tx.send(line);
    }

    /// Observe every line published from this moment onward, in publish
    /// order. No history is replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let hub = LogHub::new(16);
        hub.publish("dep-1", "nobody listening");
    }

    #[tokio::test]
    async fn test_lines_arrive_in_publish_order() {
        let hub = LogHub::new(16);
        let mut rx = hub.subscribe();

        hub.publish("dep-1", "first");
        hub.publish("dep-1", "second");
        hub.publish("dep-1", "third");

        assert_eq!(rx.recv().await.unwrap().text, "first");
        assert_eq!(rx.recv().await.unwrap().text, "second");
        assert_eq!(rx.recv().await.unwrap().text, "third");
    }

    #[tokio::test]
    async fn test_lines_keep_their_deployment_tag() {
        let hub = LogHub::new(16);
        let mut rx = hub.subscribe();

        hub.publish("dep-a", "from a");
        hub.publish("dep-b", "from b");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.deployment_id, "dep-a");
        assert_eq!(first.text, "from a");
        assert_eq!(second.deployment_id, "dep-b");
        assert_eq!(second.text, "from b");
    }

    #[tokio::test]
    async fn test_subscriber_only_sees_lines_after_subscribing() {
        let hub = LogHub::new(16);
        hub.publish("dep-1", "before");

        let mut rx = hub.subscribe();
        hub.publish("dep-1", "after");

        assert_eq!(rx.recv().await.unwrap().text, "after");
    }
}
