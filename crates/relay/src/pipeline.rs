//! Notification listener: validates ledger callbacks, decodes the payload and
//! forwards the JSON frame to the broadcaster.
//!
//! The ledger callback only validates and enqueues. Decoding and fan-out run
//! on the dispatcher task so subscriber I/O never stalls block persistence.
//! With a single dispatch worker events are forwarded in emission order; with
//! more workers ordering across events is relaxed.

use std::sync::Arc;

use metrics::counter;
use notify_relay_domain::{
    decode, ledger::NotifyHandler, NotificationEvent, PayloadValue, ProgramId, RelayMessage,
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch, Semaphore,
};
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastReport, Broadcaster};

/// Why a notification was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    OtherProgram,
    NotArray,
    EmptyArray,
}

/// Checks the program id and the top-level payload shape.
pub fn validate(program_id: &ProgramId, event: &NotificationEvent) -> Result<(), Rejection> {
    if &event.source_program_id != program_id {
        return Err(Rejection::OtherProgram);
    }
    match &event.payload {
        PayloadValue::Array(items) if items.is_empty() => Err(Rejection::EmptyArray),
        PayloadValue::Array(_) => Ok(()),
        _ => Err(Rejection::NotArray),
    }
}

pub struct NotificationListener {
    program_id: ProgramId,
    queue: mpsc::Sender<NotificationEvent>,
}

impl NotificationListener {
    /// Returns the listener to register with the ledger and the receiving end
    /// of its bounded queue for [`run_dispatcher`].
    pub fn new(
        program_id: ProgramId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<NotificationEvent>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        (Self { program_id, queue }, rx)
    }

    pub fn program_id(&self) -> &ProgramId {
        &self.program_id
    }
}

impl NotifyHandler for NotificationListener {
    fn on_notify(&self, event: NotificationEvent) {
        if let Err(reason) = validate(&self.program_id, &event) {
            let result = match reason {
                Rejection::OtherProgram => "dropped_program",
                Rejection::NotArray | Rejection::EmptyArray => "dropped_shape",
            };
            counter!("relay_notifications_total", "result" => result).increment(1);
            debug!(
                contract = %event.source_program_id,
                ?reason,
                "notification ignored"
            );
            return;
        }

        info!(
            contract = %event.source_program_id,
            block = event.block_height,
            txid = %event.tx_hash,
            "runtime notify event"
        );

        match self.queue.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                counter!("relay_notifications_total", "result" => "queue_full").increment(1);
                warn!(
                    block = event.block_height,
                    txid = %event.tx_hash,
                    "dispatch queue full, dropping notification"
                );
            }
            Err(TrySendError::Closed(event)) => {
                debug!(txid = %event.tx_hash, "dispatcher stopped, dropping notification");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Forwarded(BroadcastReport),
    DecodeFailed,
}

/// Decodes one queued event and broadcasts it. Decode failures are logged and
/// reported, never propagated.
pub async fn forward_event(event: NotificationEvent, broadcaster: &Broadcaster) -> ForwardOutcome {
    let decoded = match decode(&event.payload) {
        Ok(decoded) => decoded,
        Err(err) => {
            counter!("relay_notifications_total", "result" => "decode_error").increment(1);
            warn!(
                %err,
                block = event.block_height,
                txid = %event.tx_hash,
                "dropping undecodable notification"
            );
            return ForwardOutcome::DecodeFailed;
        }
    };
    debug!(
        from = %decoded.from,
        asset = %decoded.asset,
        price = decoded.price,
        "notification decoded"
    );

    let message = RelayMessage::new(&event, decoded);
    let frame = match message.to_json() {
        Ok(frame) => frame,
        Err(err) => {
            counter!("relay_notifications_total", "result" => "decode_error").increment(1);
            warn!(%err, txid = %event.tx_hash, "failed to encode relay message");
            return ForwardOutcome::DecodeFailed;
        }
    };

    let report = broadcaster.broadcast(&frame).await;
    counter!("relay_notifications_total", "result" => "forwarded").increment(1);
    ForwardOutcome::Forwarded(report)
}

/// Drains the listener queue until shutdown, then forwards whatever is still
/// buffered and waits for in-flight broadcasts.
pub async fn run_dispatcher(
    mut queue: mpsc::Receiver<NotificationEvent>,
    broadcaster: Arc<Broadcaster>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let workers = workers.max(1);
    let permits = Arc::new(Semaphore::new(workers));

    let mut stopping = false;
    loop {
        let event = if stopping {
            queue.recv().await
        } else {
            let received = tokio::select! {
                event = queue.recv() => Some(event),
                _ = shutdown.wait_for(|stop| *stop) => None,
            };
            match received {
                Some(event) => event,
                None => {
                    // Stop taking new events but forward what is buffered.
                    stopping = true;
                    queue.close();
                    continue;
                }
            }
        };
        let Some(event) = event else {
            break;
        };

        if workers == 1 {
            forward_event(event, &broadcaster).await;
            continue;
        }

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let broadcaster = Arc::clone(&broadcaster);
        tokio::spawn(async move {
            forward_event(event, &broadcaster).await;
            drop(permit);
        });
    }

    // Every permit back means every spawned forward has finished.
    let _ = permits.acquire_many(workers as u32).await;
    debug!("notification dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{tests::RecordingSink, SubscriberRegistry};
    use notify_relay_domain::DecodedEvent;
    use std::time::Duration;

    fn program() -> ProgramId {
        ProgramId::parse("cfdff42a0fa99aeee31e2af5e140e0f9040b5d46").unwrap()
    }

    fn other_program() -> ProgramId {
        ProgramId::parse("0000000000000000000000000000000000000001").unwrap()
    }

    fn sell_event(program: ProgramId, price: i64) -> NotificationEvent {
        NotificationEvent {
            source_program_id: program,
            payload: PayloadValue::Array(vec![
                PayloadValue::bytes(b"addr1".to_vec()),
                PayloadValue::bytes(b"NEO".to_vec()),
                PayloadValue::integer(price),
            ]),
            block_height: 12,
            tx_hash: "0xfeed".into(),
        }
    }

    fn broadcaster_with(sink: Arc<RecordingSink>) -> Arc<Broadcaster> {
        let registry = Arc::new(SubscriberRegistry::new());
        registry.add(None, sink);
        Arc::new(Broadcaster::new(registry, Duration::from_secs(1)))
    }

    #[test]
    fn validation_drops_foreign_and_misshapen_events() {
        assert_eq!(validate(&program(), &sell_event(program(), 1)), Ok(()));
        assert_eq!(
            validate(&program(), &sell_event(other_program(), 1)),
            Err(Rejection::OtherProgram)
        );

        let mut empty = sell_event(program(), 1);
        empty.payload = PayloadValue::Array(vec![]);
        assert_eq!(validate(&program(), &empty), Err(Rejection::EmptyArray));

        let mut scalar = sell_event(program(), 1);
        scalar.payload = PayloadValue::Boolean(true);
        assert_eq!(validate(&program(), &scalar), Err(Rejection::NotArray));
    }

    #[test]
    fn on_notify_only_queues_valid_events() {
        let (listener, mut rx) = NotificationListener::new(program(), 8);
        listener.on_notify(sell_event(other_program(), 1));
        listener.on_notify(sell_event(program(), 2));

        let queued = rx.try_recv().expect("valid event queued");
        assert_eq!(queued.source_program_id, program());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (listener, mut rx) = NotificationListener::new(program(), 1);
        listener.on_notify(sell_event(program(), 1));
        listener.on_notify(sell_event(program(), 2));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_event_sends_json_frame() {
        let sink = Arc::new(RecordingSink::default());
        let broadcaster = broadcaster_with(sink.clone());

        let outcome = forward_event(sell_event(program(), -1), &broadcaster).await;
        assert_eq!(
            outcome,
            ForwardOutcome::Forwarded(BroadcastReport {
                delivered: 1,
                failed: 0
            })
        );

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        let message: RelayMessage = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(
            (message.from.as_str(), message.asset.as_str(), message.price),
            ("addr1", "NEO", -1)
        );
        assert_eq!(message.block, 12);
    }

    #[tokio::test]
    async fn decode_failure_is_dropped_quietly() {
        let sink = Arc::new(RecordingSink::default());
        let broadcaster = broadcaster_with(sink.clone());

        let mut short = sell_event(program(), 1);
        short.payload = PayloadValue::Array(vec![PayloadValue::bytes(b"only".to_vec())]);
        assert_eq!(
            forward_event(short, &broadcaster).await,
            ForwardOutcome::DecodeFailed
        );
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn single_worker_dispatch_preserves_order_and_drains_on_shutdown() {
        let sink = Arc::new(RecordingSink::default());
        let broadcaster = broadcaster_with(sink.clone());
        let (listener, rx) = NotificationListener::new(program(), 16);
        for price in 0..5 {
            listener.on_notify(sell_event(program(), price));
        }

        let (tx, shutdown) = watch::channel(false);
        tx.send(true).unwrap();
        run_dispatcher(rx, broadcaster, 1, shutdown).await;

        let prices: Vec<i64> = sink
            .frames()
            .iter()
            .map(|frame| serde_json::from_str::<DecodedEvent>(frame).unwrap().price)
            .collect();
        assert_eq!(prices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn spawned_dispatcher_forwards_buffered_events_after_shutdown() {
        let sink = Arc::new(RecordingSink::default());
        let broadcaster = broadcaster_with(sink.clone());
        let (listener, rx) = NotificationListener::new(program(), 16);
        let (tx, shutdown) = watch::channel(false);

        let dispatcher = tokio::spawn(run_dispatcher(rx, broadcaster, 2, shutdown));
        for price in 0..3 {
            listener.on_notify(sell_event(program(), price));
        }
        tx.send(true).unwrap();
        dispatcher.await.unwrap();

        assert_eq!(sink.frames().len(), 3);
    }

    #[tokio::test]
    async fn pooled_dispatch_forwards_every_event() {
        let sink = Arc::new(RecordingSink::default());
        let broadcaster = broadcaster_with(sink.clone());
        let (listener, rx) = NotificationListener::new(program(), 64);
        for price in 0..20 {
            listener.on_notify(sell_event(program(), price));
        }
        drop(listener);

        let (_tx, shutdown) = watch::channel(false);
        run_dispatcher(rx, broadcaster, 4, shutdown).await;

        let mut prices: Vec<i64> = sink
            .frames()
            .iter()
            .map(|frame| serde_json::from_str::<DecodedEvent>(frame).unwrap().price)
            .collect();
        prices.sort_unstable();
        assert_eq!(prices, (0..20).collect::<Vec<_>>());
    }
}
