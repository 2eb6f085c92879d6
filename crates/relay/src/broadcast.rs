use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use metrics::{counter, histogram};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::registry::{DeliveryError, SubscriberRegistry};

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers one message to every subscriber in a registry snapshot. A failing
/// or slow subscriber is dropped from the registry without affecting the
/// others.
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriberRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Returns once every delivery attempt has succeeded, failed or timed out.
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let members = self.registry.snapshot();
        histogram!("relay_broadcast_fanout").record(members.len() as f64);

        let attempts = members.into_iter().map(|subscriber| async move {
            let outcome = match timeout(self.send_timeout, subscriber.send_text(message)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
            };
            (subscriber, outcome)
        });

        let mut report = BroadcastReport::default();
        for (subscriber, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => {
                    counter!("relay_deliveries_total", "result" => "ok").increment(1);
                    report.delivered += 1;
                }
                Err(err) => {
                    let result = match err {
                        DeliveryError::Timeout(_) => "timeout",
                        _ => "error",
                    };
                    counter!("relay_deliveries_total", "result" => result).increment(1);
                    warn!(
                        subscriber = %subscriber.id(),
                        peer = ?subscriber.peer(),
                        %err,
                        "delivery failed, dropping subscriber"
                    );
                    self.registry.remove(subscriber.id());
                    subscriber.close();
                    report.failed += 1;
                }
            }
        }

        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "broadcast complete"
        );
        report
    }
}
