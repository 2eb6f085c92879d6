use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use metrics::counter;
use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use notify_relay_domain::{
    config::{ConfigError, RelayConfig},
    ledger::{Ledger, LedgerError, StorageError},
    services::telemetry::TelemetryError,
};

use crate::{
    acceptor::{AcceptError, ConnectionAcceptor},
    broadcast::Broadcaster,
    pipeline::{run_dispatcher, NotificationListener},
    registry::SubscriberRegistry,
};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Accept(#[from] AcceptError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Calls the ledger's persistence step every `period` until shutdown. A
/// failed tick is logged and the next one runs on schedule.
pub async fn run_sync_driver<L>(ledger: Arc<L>, period: Duration, mut shutdown: watch::Receiver<bool>)
where
    L: Ledger + ?Sized,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }

        match ledger.persist_blocks().await {
            Ok(outcome) => {
                counter!("ledger_persist_ticks_total", "result" => "ok").increment(1);
                if outcome.blocks > 0 {
                    debug!(
                        blocks = outcome.blocks,
                        notifications = outcome.notifications,
                        height = ?ledger.height(),
                        "persisted blocks"
                    );
                }
            }
            Err(err) => {
                counter!("ledger_persist_ticks_total", "result" => "error").increment(1);
                warn!(%err, "persistence tick failed");
            }
        }
    }
    debug!("sync driver stopped");
}

/// Logs the persisted height against the announced header height.
pub async fn run_heartbeat<L>(ledger: Arc<L>, period: Duration, mut shutdown: watch::Receiver<bool>)
where
    L: Ledger + ?Sized,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }

        let height = ledger.height();
        let header_height = ledger.header_height();
        info!(
            "Block {} / {}",
            display_height(height),
            display_height(header_height)
        );
    }
}

fn display_height(height: Option<u64>) -> String {
    height.map_or_else(|| "-".to_string(), |h| h.to_string())
}

/// Running relay: sync driver, dispatcher, acceptor and optional heartbeat.
pub struct RelayHandle {
    local_addr: SocketAddr,
    registry: Arc<SubscriberRegistry>,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    sync: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Registers the listener with the ledger, binds the subscriber endpoint
    /// and spawns every unit. The handler is installed before the first
    /// persistence tick.
    pub async fn start<L>(
        config: &RelayConfig,
        persist_interval: Duration,
        ledger: Arc<L>,
    ) -> Result<Self, RelayError>
    where
        L: Ledger + 'static,
    {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            config.send_timeout(),
        ));

        let (listener, queue) =
            NotificationListener::new(*config.program_id(), config.dispatch_queue());
        ledger.register_notify_handler(Arc::new(listener))?;

        let acceptor =
            ConnectionAcceptor::bind(&config.ws_bind_address(), Arc::clone(&registry)).await?;
        let local_addr = acceptor.local_addr()?;
        info!(%local_addr, "subscriber websocket server running");

        let (shutdown, shutdown_rx) = watch::channel(false);

        let dispatcher = tokio::spawn(run_dispatcher(
            queue,
            broadcaster,
            config.dispatch_workers(),
            shutdown_rx.clone(),
        ));
        let sync = tokio::spawn(run_sync_driver(
            Arc::clone(&ledger),
            persist_interval,
            shutdown_rx.clone(),
        ));
        let heartbeat = config.heartbeat_interval().map(|period| {
            tokio::spawn(run_heartbeat(
                Arc::clone(&ledger),
                period,
                shutdown_rx.clone(),
            ))
        });
        let acceptor = tokio::spawn(async move {
            if let Err(err) = acceptor.run(shutdown_rx).await {
                error!(%err, "connection acceptor terminated");
            }
        });

        info!(
            program = %config.program_id(),
            "everything set up and running, waiting for events"
        );

        Ok(Self {
            local_addr,
            registry,
            shutdown,
            acceptor,
            sync,
            dispatcher,
            heartbeat,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Stops accepting and syncing, drains queued notifications and waits for
    /// every unit. Open subscriber connections are not closed.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);

        let units = [
            ("acceptor", Some(self.acceptor)),
            ("sync driver", Some(self.sync)),
            ("heartbeat", self.heartbeat),
            ("dispatcher", Some(self.dispatcher)),
        ];
        for (name, handle) in units {
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    error!(unit = name, %err, "relay unit panicked");
                }
            }
        }
        info!("shutting down");
    }
}

/// Runs the relay until `shutdown` resolves.
pub async fn run_relay<L, F>(
    config: RelayConfig,
    persist_interval: Duration,
    ledger: Arc<L>,
    shutdown: F,
) -> Result<(), RelayError>
where
    L: Ledger + 'static,
    F: Future<Output = ()>,
{
    let handle = RelayHandle::start(&config, persist_interval, ledger).await?;
    shutdown.await;
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::tests::{connect, wait_for_members};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use notify_relay_domain::{
        ledger::{NotifyHandler, PersistOutcome},
        NotificationEvent, PayloadValue, ProgramId, RelayMessage,
    };
    use once_cell::sync::OnceCell;
    use std::sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex,
    };
    use tokio_tungstenite::tungstenite::Message;

    const WATCHED: &str = "cfdff42a0fa99aeee31e2af5e140e0f9040b5d46";

    /// Ledger whose "blocks" are notifications queued by the test.
    #[derive(Default)]
    struct ScriptedLedger {
        pending: Mutex<Vec<NotificationEvent>>,
        handler: OnceCell<Arc<dyn NotifyHandler>>,
        height: AtomicU64,
        ticks: AtomicUsize,
        fail_every_other: bool,
    }

    impl ScriptedLedger {
        fn emit(&self, event: NotificationEvent) {
            self.pending.lock().unwrap().push(event);
        }

        fn handler(&self) -> Arc<dyn NotifyHandler> {
            Arc::clone(self.handler.get().expect("handler registered"))
        }
    }

    #[async_trait]
    impl Ledger for ScriptedLedger {
        async fn persist_blocks(&self) -> Result<PersistOutcome, LedgerError> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail_every_other && tick % 2 == 0 {
                return Err(LedgerError::Rpc("node unavailable".into()));
            }
            let events: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
            let mut outcome = PersistOutcome::default();
            if let Some(handler) = self.handler.get() {
                for event in events {
                    handler.on_notify(event);
                    outcome.notifications += 1;
                }
            }
            self.height.fetch_add(1, Ordering::SeqCst);
            outcome.blocks = 1;
            Ok(outcome)
        }

        fn height(&self) -> Option<u64> {
            Some(self.height.load(Ordering::SeqCst))
        }

        fn header_height(&self) -> Option<u64> {
            self.height()
        }

        fn register_notify_handler(
            &self,
            handler: Arc<dyn NotifyHandler>,
        ) -> Result<(), LedgerError> {
            self.handler
                .set(handler)
                .map_err(|_| LedgerError::HandlerAlreadyRegistered)
        }
    }

    fn watched() -> ProgramId {
        ProgramId::parse(WATCHED).unwrap()
    }

    fn sell(price: i64) -> NotificationEvent {
        NotificationEvent {
            source_program_id: watched(),
            payload: PayloadValue::Array(vec![
                PayloadValue::bytes(b"addr1".to_vec()),
                PayloadValue::bytes(b"NEO".to_vec()),
                PayloadValue::integer(price),
            ]),
            block_height: 1,
            tx_hash: "0xfeed".into(),
        }
    }

    fn config() -> RelayConfig {
        RelayConfig::new(watched(), "127.0.0.1", 0).with_heartbeat(None)
    }

    async fn next_message(
        client: &mut crate::acceptor::tests::Client,
    ) -> Option<RelayMessage> {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .ok()??
            .ok()?;
        match frame {
            Message::Text(text) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn sync_driver_survives_failed_ticks() {
        let ledger = Arc::new(ScriptedLedger {
            fail_every_other: true,
            ..ScriptedLedger::default()
        });
        let (tx, rx) = watch::channel(false);
        let driver = tokio::spawn(run_sync_driver(
            Arc::clone(&ledger),
            Duration::from_millis(5),
            rx,
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while ledger.ticks.load(Ordering::SeqCst) < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("driver keeps ticking");

        tx.send(true).unwrap();
        driver.await.unwrap();
        assert!(ledger.height().unwrap() >= 2);
    }

    #[tokio::test]
    async fn second_start_on_same_ledger_is_rejected() {
        let ledger = Arc::new(ScriptedLedger::default());
        let handle = RelayHandle::start(&config(), Duration::from_millis(10), Arc::clone(&ledger))
            .await
            .unwrap();
        let err = RelayHandle::start(&config(), Duration::from_millis(10), Arc::clone(&ledger))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RelayError::Ledger(LedgerError::HandlerAlreadyRegistered)
        ));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn notification_reaches_connected_subscribers_only() {
        let ledger = Arc::new(ScriptedLedger::default());
        let handle = RelayHandle::start(&config(), Duration::from_millis(10), Arc::clone(&ledger))
            .await
            .unwrap();

        let mut early = connect(handle.local_addr()).await;
        wait_for_members(handle.registry(), 1).await;

        ledger.emit(sell(-1));
        let message = next_message(&mut early).await.expect("early subscriber notified");
        assert_eq!(message.from, "addr1");
        assert_eq!(message.asset, "NEO");
        assert_eq!(message.price, -1);
        assert_eq!(message.contract, format!("0x{WATCHED}"));

        let mut late = connect(handle.local_addr()).await;
        wait_for_members(handle.registry(), 2).await;
        let nothing = tokio::time::timeout(Duration::from_millis(200), late.next()).await;
        assert!(nothing.is_err(), "late subscriber must not see earlier event");

        // Exactly one message for the early subscriber.
        let extra = tokio::time::timeout(Duration::from_millis(200), early.next()).await;
        assert!(extra.is_err());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn foreign_and_malformed_notifications_are_not_forwarded() {
        let ledger = Arc::new(ScriptedLedger::default());
        let handle = RelayHandle::start(&config(), Duration::from_millis(10), Arc::clone(&ledger))
            .await
            .unwrap();
        let mut client = connect(handle.local_addr()).await;
        wait_for_members(handle.registry(), 1).await;

        let mut foreign = sell(1);
        foreign.source_program_id =
            ProgramId::parse("0000000000000000000000000000000000000001").unwrap();
        ledger.emit(foreign);
        let mut short = sell(2);
        short.payload = PayloadValue::Array(vec![PayloadValue::bytes(b"x".to_vec())]);
        ledger.emit(short);
        ledger.emit(sell(3));

        let message = next_message(&mut client).await.expect("valid event relayed");
        assert_eq!(message.price, 3);

        handle.shutdown().await;
    }

    const SENTINEL: i64 = 1_000;

    /// Reads relayed prices until the sentinel arrives.
    async fn prices_until_sentinel(mut client: crate::acceptor::tests::Client) -> Vec<i64> {
        let mut prices = Vec::new();
        while let Some(message) = next_message(&mut client).await {
            if message.price == SENTINEL {
                return prices;
            }
            prices.push(message.price);
        }
        panic!("sentinel not received, got {prices:?}");
    }

    #[tokio::test]
    async fn subscribers_joining_mid_stream_never_break_delivery() {
        let ledger = Arc::new(ScriptedLedger::default());
        let handle = RelayHandle::start(&config(), Duration::from_millis(10), Arc::clone(&ledger))
            .await
            .unwrap();
        let addr = handle.local_addr();

        let anchors: Vec<_> = futures_util::future::join_all((0..10).map(|_| connect(addr))).await;
        wait_for_members(handle.registry(), 10).await;

        let joiners = tokio::spawn(futures_util::future::join_all(
            (0..100).map(move |_| connect(addr)),
        ));
        let listener = ledger.handler();
        for price in 0..50 {
            listener.on_notify(sell(price));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let joiners = joiners.await.unwrap();
        wait_for_members(handle.registry(), 110).await;
        listener.on_notify(sell(SENTINEL));

        let anchor_prices =
            futures_util::future::join_all(anchors.into_iter().map(prices_until_sentinel)).await;
        for prices in &anchor_prices {
            assert_eq!(prices, &(0..50).collect::<Vec<_>>());
        }

        // A joiner sees a gap-free tail of the stream, never a duplicate.
        let joiner_prices =
            futures_util::future::join_all(joiners.into_iter().map(prices_until_sentinel)).await;
        for prices in &joiner_prices {
            let first = prices.first().copied().unwrap_or(50);
            assert_eq!(prices, &(first..50).collect::<Vec<_>>());
        }
        assert_eq!(handle.registry().len(), 110);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn pooled_dispatch_delivers_every_event_to_every_subscriber() {
        let ledger = Arc::new(ScriptedLedger::default());
        let config = config().with_dispatch(4, 64);
        let handle = RelayHandle::start(&config, Duration::from_millis(10), Arc::clone(&ledger))
            .await
            .unwrap();
        let addr = handle.local_addr();

        let clients: Vec<_> = futures_util::future::join_all((0..20).map(|_| connect(addr))).await;
        wait_for_members(handle.registry(), 20).await;

        for price in 0..30 {
            ledger.emit(sell(price));
        }

        let received = futures_util::future::join_all(clients.into_iter().map(
            |mut client| async move {
                let mut prices = Vec::new();
                while prices.len() < 30 {
                    match next_message(&mut client).await {
                        Some(message) => prices.push(message.price),
                        None => break,
                    }
                }
                prices.sort_unstable();
                prices
            },
        ))
        .await;
        for prices in received {
            assert_eq!(prices, (0..30).collect::<Vec<_>>());
        }

        handle.shutdown().await;
    }
}
