//! Ledger backed by a NEO node's JSON-RPC interface. Each persistence step
//! pulls the next blocks, reads the application log of every invocation and
//! hands monitored notifications to the registered handler.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use metrics::gauge;
use notify_relay_domain::{
    ledger::{Ledger, LedgerError, LedgerStateStore, NotifyHandler, PersistOutcome},
    NotificationEvent, ProgramId,
};
use once_cell::sync::OnceCell;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

mod types;

pub use types::{
    ApplicationLog, BlockResponse, BlockTransaction, ContractParameter, Execution, RpcNotification,
};
use types::{JsonRpcRequest, JsonRpcResponse};

/// Node returns this code when it holds no application log for a transaction.
const UNKNOWN_TRANSACTION: i64 = -100;
const HEIGHT_UNKNOWN: u64 = u64::MAX;

#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn block_count(&self) -> Result<u64, LedgerError>;
    async fn block(&self, index: u64) -> Result<BlockResponse, LedgerError>;
    async fn application_log(&self, txid: &str) -> Result<Option<ApplicationLog>, LedgerError>;
}

enum CallError {
    Transport(String),
    Remote { code: i64, message: String },
}

impl CallError {
    fn into_ledger(self, method: &str) -> LedgerError {
        match self {
            CallError::Transport(reason) => LedgerError::Rpc(format!("{method}: {reason}")),
            CallError::Remote { code, message } => {
                LedgerError::Rpc(format!("{method}: node error {code}: {message}"))
            }
        }
    }
}

pub struct HttpNodeClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpNodeClient {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(url: impl Into<String>) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()
            .map_err(|err| LedgerError::Rpc(err.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<P, R>(&self, method: &'static str, params: P) -> Result<R, CallError>
    where
        P: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response: JsonRpcResponse<R> = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| CallError::Transport(err.to_string()))?
            .json()
            .await
            .map_err(|err| CallError::Transport(err.to_string()))?;

        if let Some(error) = response.error {
            return Err(CallError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| CallError::Transport("response carried no result".to_string()))
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn block_count(&self) -> Result<u64, LedgerError> {
        self.call("getblockcount", json!([]))
            .await
            .map_err(|err| err.into_ledger("getblockcount"))
    }

    async fn block(&self, index: u64) -> Result<BlockResponse, LedgerError> {
        self.call("getblock", json!([index, 1]))
            .await
            .map_err(|err| err.into_ledger("getblock"))
    }

    async fn application_log(&self, txid: &str) -> Result<Option<ApplicationLog>, LedgerError> {
        match self.call("getapplicationlog", json!([txid])).await {
            Ok(log) => Ok(Some(log)),
            Err(CallError::Remote { code, .. }) if code == UNKNOWN_TRANSACTION => Ok(None),
            Err(err) => Err(err.into_ledger("getapplicationlog")),
        }
    }
}

pub struct RpcLedger<C, S> {
    node: C,
    store: S,
    programs: HashSet<ProgramId>,
    max_blocks_per_tick: u64,
    next_height: AtomicU64,
    height: AtomicU64,
    header_height: AtomicU64,
    handler: OnceCell<Arc<dyn NotifyHandler>>,
    tick: Mutex<()>,
}

impl<C, S> RpcLedger<C, S>
where
    C: NodeClient,
    S: LedgerStateStore,
{
    /// Resumes after the last persisted block, or at `start_height` on an
    /// empty store.
    pub async fn open(
        node: C,
        store: S,
        programs: impl IntoIterator<Item = ProgramId>,
        start_height: u64,
        max_blocks_per_tick: u64,
    ) -> Result<Self, LedgerError> {
        let persisted = store.last_persisted_height().await?;
        let next_height = persisted.map_or(start_height, |height| height + 1);
        Ok(Self {
            node,
            store,
            programs: programs.into_iter().collect(),
            max_blocks_per_tick: max_blocks_per_tick.max(1),
            next_height: AtomicU64::new(next_height),
            height: AtomicU64::new(persisted.unwrap_or(HEIGHT_UNKNOWN)),
            header_height: AtomicU64::new(HEIGHT_UNKNOWN),
            handler: OnceCell::new(),
            tick: Mutex::new(()),
        })
    }

    async fn collect_block(&self, index: u64) -> Result<Vec<NotificationEvent>, LedgerError> {
        let block = self.node.block(index).await?;
        let mut events = Vec::new();

        for tx in block.tx.iter().filter(|tx| tx.is_invocation()) {
            let Some(log) = self.node.application_log(&tx.txid).await? else {
                debug!(block = index, txid = %tx.txid, "no application log");
                continue;
            };
            for execution in log.executions.iter().filter(|e| e.halted()) {
                for notification in &execution.notifications {
                    if let Some(event) = self.to_event(index, &tx.txid, notification) {
                        events.push(event);
                    }
                }
            }
        }
        Ok(events)
    }

    fn to_event(
        &self,
        block_height: u64,
        txid: &str,
        notification: &RpcNotification,
    ) -> Option<NotificationEvent> {
        let program = ProgramId::parse(&notification.contract).ok()?;
        if !self.programs.contains(&program) {
            return None;
        }
        match notification.state.to_payload() {
            Ok(payload) => Some(NotificationEvent {
                source_program_id: program,
                payload,
                block_height,
                tx_hash: txid.to_string(),
            }),
            Err(reason) => {
                warn!(
                    block = block_height,
                    txid,
                    %reason,
                    "skipping notification with unsupported payload"
                );
                None
            }
        }
    }
}

fn load_height(value: &AtomicU64) -> Option<u64> {
    match value.load(Ordering::Acquire) {
        HEIGHT_UNKNOWN => None,
        height => Some(height),
    }
}

#[async_trait]
impl<C, S> Ledger for RpcLedger<C, S>
where
    C: NodeClient,
    S: LedgerStateStore,
{
    async fn persist_blocks(&self) -> Result<PersistOutcome, LedgerError> {
        let _tick = self.tick.lock().await;

        let count = self.node.block_count().await?;
        let Some(header) = count.checked_sub(1) else {
            return Ok(PersistOutcome::default());
        };
        self.header_height.store(header, Ordering::Release);
        gauge!("ledger_header_height").set(header as f64);

        let mut outcome = PersistOutcome::default();
        let mut next = self.next_height.load(Ordering::Acquire);
        while next <= header && outcome.blocks < self.max_blocks_per_tick {
            let events = self.collect_block(next).await?;

            // The block counts as accepted once its height is stored;
            // handlers only see notifications of accepted blocks.
            self.store.upsert_last_persisted_height(next).await?;
            self.height.store(next, Ordering::Release);
            self.next_height.store(next + 1, Ordering::Release);
            gauge!("ledger_height").set(next as f64);

            if let Some(handler) = self.handler.get() {
                for event in events {
                    handler.on_notify(event);
                    outcome.notifications += 1;
                }
            }
            outcome.blocks += 1;
            next += 1;
        }

        Ok(outcome)
    }

    fn height(&self) -> Option<u64> {
        load_height(&self.height)
    }

    fn header_height(&self) -> Option<u64> {
        load_height(&self.header_height)
    }

    fn register_notify_handler(&self, handler: Arc<dyn NotifyHandler>) -> Result<(), LedgerError> {
        self.handler
            .set(handler)
            .map_err(|_| LedgerError::HandlerAlreadyRegistered)
    }
}
