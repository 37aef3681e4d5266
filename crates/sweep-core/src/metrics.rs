//! Metric fan-out from trials to whoever is listening.
//!
//! Trials report intermediate and final metrics through their substrate
//! (stdout tailing, the callback gateway, a mounted metrics file). All of
//! those paths converge on a single [`MetricBus`]; consumers subscribe and
//! receive every metric published after the subscription was created.
//! Dropping the receiver is how a listener detaches.

use crate::trial::TrialId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffered capacity per subscriber. A slow subscriber that falls
/// further behind than this loses the oldest metrics (`RecvError::Lagged`),
/// it never blocks publishers.
const METRIC_BUS_CAPACITY: usize = 1024;

/// One metric report from a running trial, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialMetric {
    pub trial_id: TrialId,
    /// Raw metric payload as produced by the trial, usually a JSON document
    /// the tuner understands. The orchestration layer does not parse it.
    pub data: String,
}

impl TrialMetric {
    #[must_use]
    pub fn new(trial_id: TrialId, data: impl Into<String>) -> Self {
        Self { trial_id, data: data.into() }
    }
}

/// Broadcast channel carrying [`TrialMetric`] values.
#[derive(Debug, Clone)]
pub struct MetricBus {
    sender: broadcast::Sender<TrialMetric>,
}

impl MetricBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(METRIC_BUS_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Attaches a listener. The receiver only sees metrics published after
    /// this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TrialMetric> {
        self.sender.subscribe()
    }

    /// Publishes a metric to all current subscribers. Metrics published
    /// while nobody is subscribed are dropped, which matches how reports
    /// from already-forgotten trials are treated.
    pub fn publish(&self, metric: TrialMetric) {
        let _ = self.sender.send(metric);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MetricBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_metrics() {
        let bus = MetricBus::new();
        let mut rx = bus.subscribe();

        bus.publish(TrialMetric::new(TrialId::from("abc12345"), "{\"default\": 0.93}"));

        let metric = rx.recv().await.unwrap();
        assert_eq!(metric.trial_id.as_str(), "abc12345");
        assert_eq!(metric.data, "{\"default\": 0.93}");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = MetricBus::new();
        bus.publish(TrialMetric::new(TrialId::from("abc12345"), "ignored"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_metrics() {
        let bus = MetricBus::new();
        bus.publish(TrialMetric::new(TrialId::from("aaaaaaaa"), "early"));

        let mut rx = bus.subscribe();
        bus.publish(TrialMetric::new(TrialId::from("bbbbbbbb"), "late"));

        let metric = rx.recv().await.unwrap();
        assert_eq!(metric.data, "late");
    }
}
