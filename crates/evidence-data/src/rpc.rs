//! Alloy JSON-RPC chain source.
//!
//! Transactions and receipts are read through raw JSON-RPC calls so that
//! backend-specific receipt extras (`revertReason`) survive; block headers,
//! balances and code go through the typed provider API.
//!
//! Tracer queries are best-effort. The call tree is tried with geth's
//! `callTracer` first, then with the parity-style `trace_transaction`, then
//! given up. A tracer that the backend reports as unsupported is not asked
//! again for the rest of the run.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::network::Ethereum;
use alloy::primitives::{Address, Bytes, B256, U256, U64};
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::eth::{BlockId, BlockNumberOrTag};
use alloy::transports::TransportError;
use dashmap::DashMap;
use eyre::{eyre, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use serde_json::value::RawValue;

use crate::source::{Capture, ChainSource};
use crate::types::{
    from_json_unbounded, CallKind, CallTraceNode, FetchedTransaction, LogRecord,
    PrestateSnapshot, TransactionRecord, TxStatus,
};

type ProviderType = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider<Ethereum>,
>;

/// Default bound on a single tracer attempt.
pub const DEFAULT_TRACER_TIMEOUT: Duration = Duration::from_secs(30);

/// Wording used by backends that report an unknown method with a
/// non-standard error code.
const METHOD_NOT_FOUND_MESSAGE: &str = "method not found";

/// JSON-RPC code for an unknown method.
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Default)]
struct TracerSupport {
    call_tracer_missing: AtomicBool,
    parity_trace_missing: AtomicBool,
    prestate_missing: AtomicBool,
}

/// Chain source backed by a live JSON-RPC endpoint.
pub struct RpcSource {
    provider: Arc<ProviderType>,
    block_timestamps: DashMap<B256, u64>,
    support: TracerSupport,
    tracer_timeout: Duration,
}

impl RpcSource {
    /// Connects to `rpc_url` and checks connectivity with `eth_blockNumber`.
    ///
    /// # Errors
    /// Returns error if the URL is malformed or the endpoint does not answer.
    #[tracing::instrument(skip_all, fields(rpc_url = %rpc_url))]
    pub async fn new(rpc_url: &str) -> Result<Self> {
        let provider =
            ProviderBuilder::new().on_http(rpc_url.parse().wrap_err("invalid RPC URL format")?);
        let provider = Arc::new(provider);

        let block_number = provider
            .get_block_number()
            .await
            .wrap_err("failed to test RPC connectivity with eth_blockNumber")?;

        tracing::info!(
            rpc_url = %rpc_url,
            latest_block = block_number,
            "RPC connection successful"
        );

        Ok(Self {
            provider,
            block_timestamps: DashMap::new(),
            support: TracerSupport::default(),
            tracer_timeout: DEFAULT_TRACER_TIMEOUT,
        })
    }

    /// Bounds every tracer attempt; [`DEFAULT_TRACER_TIMEOUT`] otherwise.
    pub fn with_tracer_timeout(mut self, timeout: Duration) -> Self {
        self.tracer_timeout = timeout;
        self
    }

    async fn block_timestamp(&self, block_hash: B256) -> Result<u64> {
        if let Some(ts) = self.block_timestamps.get(&block_hash) {
            return Ok(*ts);
        }

        let block = self
            .provider
            .get_block(BlockId::from(block_hash))
            .await
            .wrap_err_with(|| format!("failed to fetch block {block_hash}"))?
            .ok_or_else(|| eyre!("block {block_hash} not found"))?;

        let ts = block.header.timestamp;
        self.block_timestamps.insert(block_hash, ts);
        Ok(ts)
    }

    /// One bounded tracer attempt. `missing` is set once the backend reports
    /// the method as unsupported, and short-circuits later attempts.
    async fn try_tracer<R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: serde_json::Value,
        missing: &AtomicBool,
    ) -> Capture<R> {
        if missing.load(Ordering::Relaxed) {
            return Capture::Unsupported;
        }

        let call = self
            .provider
            .raw_request::<_, Option<Box<RawValue>>>(method.into(), params);
        let response = tokio::time::timeout(self.tracer_timeout, call).await.ok();
        settle_tracer(method, response, missing, self.tracer_timeout)
    }
}

/// Maps one tracer response onto a [`Capture`].
///
/// `response` is `None` when the attempt timed out. A `null` result and an
/// unknown-method error both mark the tracer as missing for the rest of the
/// run. Tracer output is parsed without a nesting limit because call trees
/// can be up to 1024 frames deep.
fn settle_tracer<R: DeserializeOwned>(
    method: &'static str,
    response: Option<Result<Option<Box<RawValue>>, TransportError>>,
    missing: &AtomicBool,
    timeout: Duration,
) -> Capture<R> {
    match response {
        Some(Ok(Some(raw))) => match from_json_unbounded(raw.get()) {
            Ok(value) => Capture::Captured(value),
            Err(err) => Capture::Failed(format!("{method}: malformed tracer output: {err}")),
        },
        Some(Ok(None)) => {
            mark_missing(method, missing, "null result");
            Capture::Unsupported
        }
        Some(Err(err)) if is_unsupported(&err) => {
            mark_missing(method, missing, &err);
            Capture::Unsupported
        }
        Some(Err(err)) => Capture::Failed(format!("{method}: {err}")),
        None => Capture::Failed(format!(
            "{method}: timed out after {}s",
            timeout.as_secs()
        )),
    }
}

fn mark_missing(method: &'static str, missing: &AtomicBool, reason: impl std::fmt::Display) {
    if !missing.swap(true, Ordering::Relaxed) {
        tracing::info!(method, %reason, "tracer unsupported by backend");
    }
}

impl ChainSource for RpcSource {
    #[tracing::instrument(skip(self), fields(tx_hash = %hash))]
    async fn fetch_transaction(&self, hash: B256) -> Result<FetchedTransaction> {
        let tx_call = self
            .provider
            .raw_request::<_, Option<RpcTransaction>>("eth_getTransactionByHash".into(), (hash,));
        let receipt_call = self
            .provider
            .raw_request::<_, Option<RpcReceipt>>("eth_getTransactionReceipt".into(), (hash,));

        let (tx, receipt) = futures::future::try_join(tx_call, receipt_call)
            .await
            .wrap_err_with(|| format!("failed to fetch transaction {hash}"))?;

        let tx = tx.ok_or_else(|| eyre!("transaction {hash} not found"))?;
        let receipt = receipt.ok_or_else(|| eyre!("receipt for {hash} not found (pending?)"))?;
        let block_hash = receipt
            .block_hash
            .ok_or_else(|| eyre!("receipt for {hash} has no block hash"))?;
        let block_timestamp = self.block_timestamp(block_hash).await?;

        Ok(merge_receipt(tx, receipt, block_timestamp))
    }

    #[tracing::instrument(skip(self), fields(tx_hash = %hash))]
    async fn call_trace(&self, hash: B256) -> Capture<CallTraceNode> {
        let mut last_error = None;

        match self
            .try_tracer::<CallTraceNode>(
                "debug_traceTransaction",
                json!([hash, { "tracer": "callTracer" }]),
                &self.support.call_tracer_missing,
            )
            .await
        {
            Capture::Captured(node) => return Capture::Captured(node),
            Capture::Unsupported => {}
            Capture::Failed(err) => {
                tracing::debug!(error = %err, "callTracer failed, trying parity traces");
                last_error = Some(err);
            }
        }

        match self
            .try_tracer::<Vec<ParityTrace>>(
                "trace_transaction",
                json!([hash]),
                &self.support.parity_trace_missing,
            )
            .await
        {
            Capture::Captured(traces) => match tree_from_parity(traces) {
                Some(node) => return Capture::Captured(node),
                None => tracing::debug!("parity trace had no root frame"),
            },
            Capture::Unsupported => {}
            Capture::Failed(err) => last_error = Some(err),
        }

        match last_error {
            Some(err) => Capture::Failed(err),
            None => Capture::Unsupported,
        }
    }

    #[tracing::instrument(skip(self), fields(tx_hash = %hash))]
    async fn prestate(&self, hash: B256) -> Capture<Vec<PrestateSnapshot>> {
        let attempts = [
            json!([hash, { "tracer": "prestateTracer", "tracerConfig": { "diffMode": false } }]),
            json!([hash, { "tracer": "prestateTracer" }]),
        ];

        let mut last_error = None;
        for params in attempts {
            match self
                .try_tracer::<HashMap<Address, RawAccountState>>(
                    "debug_traceTransaction",
                    params,
                    &self.support.prestate_missing,
                )
                .await
            {
                Capture::Captured(accounts) => return Capture::Captured(snapshots(accounts)),
                Capture::Unsupported => break,
                Capture::Failed(err) => last_error = Some(err),
            }
        }

        match last_error {
            Some(err) => Capture::Failed(err),
            None => Capture::Unsupported,
        }
    }

    async fn balance_at(&self, address: Address, block: u64) -> Result<U256> {
        self.provider
            .get_balance(address)
            .block_id(BlockId::Number(BlockNumberOrTag::Number(block)))
            .await
            .wrap_err_with(|| format!("failed to fetch balance of {address} at block {block}"))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        self.provider
            .get_code_at(address)
            .await
            .wrap_err_with(|| format!("failed to fetch code at {address}"))
    }
}

fn is_unsupported(err: &TransportError) -> bool {
    let Some(payload) = err.as_error_resp() else {
        return false;
    };
    payload.code == METHOD_NOT_FOUND
        || payload
            .message
            .to_lowercase()
            .contains(METHOD_NOT_FOUND_MESSAGE)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    value: U256,
    input: Bytes,
    #[serde(default)]
    gas_price: Option<U256>,
    #[serde(default)]
    transaction_index: Option<U64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    #[serde(default)]
    status: Option<U64>,
    gas_used: U64,
    #[serde(default)]
    effective_gas_price: Option<U256>,
    #[serde(default)]
    block_hash: Option<B256>,
    #[serde(default)]
    block_number: Option<U64>,
    #[serde(default)]
    contract_address: Option<Address>,
    #[serde(default)]
    logs: Vec<RpcLog>,
    #[serde(default)]
    revert_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    #[serde(default)]
    topics: Vec<B256>,
    #[serde(default)]
    data: Bytes,
    #[serde(default)]
    log_index: Option<U64>,
}

fn merge_receipt(tx: RpcTransaction, receipt: RpcReceipt, block_timestamp: u64) -> FetchedTransaction {
    // Pre-byzantium receipts carry a state root instead of a status.
    let status = match receipt.status {
        Some(s) if s.is_zero() => TxStatus::Revert,
        _ => TxStatus::Success,
    };

    let logs = receipt
        .logs
        .into_iter()
        .enumerate()
        .map(|(pos, log)| LogRecord {
            address: log.address,
            topics: log.topics,
            data: log.data,
            log_index: log.log_index.map(|ix| ix.to::<u64>()).unwrap_or(pos as u64),
        })
        .collect();

    let transaction = TransactionRecord {
        hash: tx.hash,
        from: tx.from,
        to: tx.to,
        value: tx.value,
        input: tx.input,
        gas_used: receipt.gas_used.to::<u64>(),
        gas_price: receipt
            .effective_gas_price
            .or(tx.gas_price)
            .unwrap_or(U256::ZERO),
        status,
        block_number: receipt.block_number.map(|n| n.to::<u64>()).unwrap_or_default(),
        block_timestamp,
        tx_index: tx.transaction_index.map(|ix| ix.to::<u64>()).unwrap_or_default(),
        contract_address: receipt.contract_address,
        revert_reason: receipt.revert_reason,
    };

    FetchedTransaction { transaction, logs }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParityTrace {
    action: ParityAction,
    #[serde(default)]
    result: Option<ParityResult>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    trace_address: Vec<usize>,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParityAction {
    from: Option<Address>,
    to: Option<Address>,
    value: Option<U256>,
    input: Option<Bytes>,
    init: Option<Bytes>,
    call_type: Option<String>,
    // selfdestruct frames
    address: Option<Address>,
    refund_address: Option<Address>,
    balance: Option<U256>,
}

#[derive(Debug, Default, Deserialize)]
struct ParityResult {
    output: Option<Bytes>,
    address: Option<Address>,
}

impl ParityTrace {
    fn into_node(self) -> Option<CallTraceNode> {
        let result = self.result.unwrap_or_default();
        let action = self.action;
        let node = match self.kind.as_str() {
            "call" => CallTraceNode {
                kind: CallKind::from_parity(action.call_type.as_deref().unwrap_or("call")),
                from: action.from?,
                to: action.to,
                value: action.value,
                input: action.input.unwrap_or_default(),
                output: result.output,
                error: self.error,
                revert_reason: None,
                calls: Vec::new(),
            },
            "create" => CallTraceNode {
                kind: CallKind::Create,
                from: action.from?,
                to: result.address,
                value: action.value,
                input: action.init.unwrap_or_default(),
                output: None,
                error: self.error,
                revert_reason: None,
                calls: Vec::new(),
            },
            "suicide" | "selfdestruct" => CallTraceNode {
                kind: CallKind::SelfDestruct,
                from: action.address?,
                to: action.refund_address,
                value: action.balance,
                input: Bytes::new(),
                output: None,
                error: self.error,
                revert_reason: None,
                calls: Vec::new(),
            },
            _ => return None,
        };
        Some(node)
    }
}

/// Rebuilds a call tree from parity's flat, `traceAddress`-addressed frames.
///
/// Frames whose parent cannot be located are dropped.
fn tree_from_parity(mut traces: Vec<ParityTrace>) -> Option<CallTraceNode> {
    traces.sort_by(|a, b| a.trace_address.cmp(&b.trace_address));

    let mut frames = traces.into_iter();
    let first = frames.next()?;
    if !first.trace_address.is_empty() {
        return None;
    }
    let mut root = first.into_node()?;

    for trace in frames {
        let path = trace.trace_address.clone();
        let Some((_, parent_path)) = path.split_last() else {
            continue;
        };
        let Some(node) = trace.into_node() else {
            continue;
        };
        match frame_at(&mut root, parent_path) {
            Some(parent) => parent.calls.push(node),
            None => tracing::debug!(trace_address = ?path, "orphan parity frame dropped"),
        }
    }

    Some(root)
}

fn frame_at<'a>(root: &'a mut CallTraceNode, path: &[usize]) -> Option<&'a mut CallTraceNode> {
    let mut node = root;
    for &ix in path {
        node = node.calls.get_mut(ix)?;
    }
    Some(node)
}

#[derive(Debug, Deserialize)]
struct RawAccountState {
    #[serde(default)]
    balance: Option<U256>,
    #[serde(default)]
    nonce: Option<u64>,
    #[serde(default)]
    code: Option<Bytes>,
    #[serde(default)]
    storage: Option<BTreeMap<B256, B256>>,
}

fn snapshots(accounts: HashMap<Address, RawAccountState>) -> Vec<PrestateSnapshot> {
    let mut out: Vec<PrestateSnapshot> = accounts
        .into_iter()
        .map(|(address, state)| PrestateSnapshot {
            address,
            balance_before: state.balance,
            nonce_before: state.nonce,
            has_code: state.code.is_some_and(|code| !code.is_empty()),
            storage_before: state.storage.unwrap_or_default(),
        })
        .collect();
    out.sort_by_key(|snap| snap.address);
    out
}
