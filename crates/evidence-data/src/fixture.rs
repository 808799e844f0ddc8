//! In-memory chain source loaded from recorded JSON.
//!
//! Fixture layout:
//!
//! ```json
//! {
//!   "transactions": [
//!     { "transaction": { ... }, "logs": [ ... ], "trace": { ... }, "prestate": [ ... ] }
//!   ],
//!   "balances": { "0x…": "0x…" },
//!   "code": { "0x…": "0x…" }
//! }
//! ```
//!
//! `trace` and `prestate` are optional; a missing one replays as an
//! unsupported tracer.

use std::collections::HashMap;
use std::path::Path;

use alloy::primitives::{Address, Bytes, B256, U256};
use eyre::{eyre, Context, Result};
use serde::{Deserialize, Serialize};

use crate::source::{Capture, ChainSource};
use crate::types::{
    from_json_unbounded, CallTraceNode, FetchedTransaction, LogRecord, PrestateSnapshot,
    TransactionRecord,
};

/// One recorded transaction with its optional tracer output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixtureTransaction {
    pub transaction: TransactionRecord,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
    #[serde(default)]
    pub trace: Option<CallTraceNode>,
    #[serde(default)]
    pub prestate: Option<Vec<PrestateSnapshot>>,
}

impl FixtureTransaction {
    pub fn new(transaction: TransactionRecord) -> Self {
        Self {
            transaction,
            logs: Vec::new(),
            trace: None,
            prestate: None,
        }
    }

    pub fn with_logs(mut self, logs: Vec<LogRecord>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_trace(mut self, trace: CallTraceNode) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_prestate(mut self, prestate: Vec<PrestateSnapshot>) -> Self {
        self.prestate = Some(prestate);
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    transactions: Vec<FixtureTransaction>,
    #[serde(default)]
    balances: HashMap<Address, U256>,
    #[serde(default)]
    code: HashMap<Address, Bytes>,
}

/// Chain source that answers from recorded data only.
#[derive(Clone, Debug, Default)]
pub struct FixtureSource {
    order: Vec<B256>,
    transactions: HashMap<B256, FixtureTransaction>,
    balances: HashMap<Address, U256>,
    code: HashMap<Address, Bytes>,
}

impl FixtureSource {
    pub fn new(transactions: Vec<FixtureTransaction>) -> Self {
        let mut source = Self::default();
        for tx in transactions {
            source.insert(tx);
        }
        source
    }

    /// Loads a fixture file from disk.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not a valid fixture.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read fixture {}", path.display()))?;
        let file: FixtureFile = from_json_unbounded(&raw)
            .wrap_err_with(|| format!("failed to parse fixture {}", path.display()))?;

        let mut source = Self::new(file.transactions);
        source.balances = file.balances;
        source.code = file.code;
        tracing::debug!(
            path = %path.display(),
            transactions = source.order.len(),
            "fixture loaded"
        );
        Ok(source)
    }

    pub fn insert(&mut self, tx: FixtureTransaction) {
        let hash = tx.transaction.hash;
        if self.transactions.insert(hash, tx).is_none() {
            self.order.push(hash);
        }
    }

    pub fn with_balance(mut self, address: Address, balance: U256) -> Self {
        self.balances.insert(address, balance);
        self
    }

    pub fn with_code(mut self, address: Address, code: Bytes) -> Self {
        self.code.insert(address, code);
        self
    }

    /// Transaction hashes in recorded order.
    /// Transaction hashes in insertion order.
    pub fn hashes(&self) -> Vec<B256> {
        self.order.clone()
    }
}

impl ChainSource for FixtureSource {
    async fn fetch_transaction(&self, hash: B256) -> Result<FetchedTransaction> {
        let tx = self
            .transactions
            .get(&hash)
            .ok_or_else(|| eyre!("transaction {hash} not found in fixture"))?;
        Ok(FetchedTransaction {
            transaction: tx.transaction.clone(),
            logs: tx.logs.clone(),
        })
    }

    async fn call_trace(&self, hash: B256) -> Capture<CallTraceNode> {
        match self.transactions.get(&hash).and_then(|tx| tx.trace.clone()) {
            Some(trace) => Capture::Captured(trace),
            None => Capture::Unsupported,
        }
    }

    async fn prestate(&self, hash: B256) -> Capture<Vec<PrestateSnapshot>> {
        match self.transactions.get(&hash).and_then(|tx| tx.prestate.clone()) {
            Some(prestate) => Capture::Captured(prestate),
            None => Capture::Unsupported,
        }
    }

    async fn balance_at(&self, address: Address, _block: u64) -> Result<U256> {
        Ok(self.balances.get(&address).copied().unwrap_or(U256::ZERO))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        Ok(self.code.get(&address).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxStatus;

    fn tx(n: u8) -> TransactionRecord {
        TransactionRecord {
            hash: B256::with_last_byte(n),
            from: Address::with_last_byte(1),
            to: Some(Address::with_last_byte(2)),
            value: U256::from(n),
            input: Bytes::new(),
            gas_used: 21_000,
            gas_price: U256::from(1),
            status: TxStatus::Success,
            block_number: 1,
            block_timestamp: 100,
            tx_index: n as u64,
            contract_address: None,
            revert_reason: None,
        }
    }

    #[tokio::test]
    async fn unknown_hash_is_a_fetch_error() {
        let source = FixtureSource::new(vec![FixtureTransaction::new(tx(1))]);
        assert!(source.fetch_transaction(B256::with_last_byte(9)).await.is_err());
        assert!(source.fetch_transaction(B256::with_last_byte(1)).await.is_ok());
    }

    #[tokio::test]
    async fn missing_tracer_output_replays_as_unsupported() {
        let source = FixtureSource::new(vec![FixtureTransaction::new(tx(1))]);
        let hash = B256::with_last_byte(1);
        assert_eq!(source.call_trace(hash).await, Capture::Unsupported);
        assert_eq!(source.prestate(hash).await, Capture::Unsupported);
    }

    #[test]
    fn hashes_keep_insertion_order() {
        let source = FixtureSource::new(vec![
            FixtureTransaction::new(tx(3)),
            FixtureTransaction::new(tx(1)),
            FixtureTransaction::new(tx(2)),
        ]);
        let hashes = source.hashes();
        assert_eq!(
            hashes,
            vec![
                B256::with_last_byte(3),
                B256::with_last_byte(1),
                B256::with_last_byte(2)
            ]
        );
    }

    #[test]
    fn load_round_trips_a_written_fixture() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let path = dir.path().join("fixture.json");
        let file = FixtureFile {
            transactions: vec![FixtureTransaction::new(tx(5))],
            balances: HashMap::from([(Address::with_last_byte(1), U256::from(77))]),
            code: HashMap::new(),
        };
        std::fs::write(&path, serde_json::to_string(&file).expect("fixture serializes"))
            .expect("fixture should write");

        let source = FixtureSource::load(&path).expect("fixture should load");
        assert_eq!(source.hashes(), vec![B256::with_last_byte(5)]);
        assert_eq!(source.balances[&Address::with_last_byte(1)], U256::from(77));
    }

    #[tokio::test]
    async fn load_keeps_call_trees_at_full_evm_depth() {
        let mut trace = String::new();
        for depth in 0..1024 {
            trace.push_str(&format!(
                r#"{{"type":"CALL","from":"0x0000000000000000000000000000000000000001","value":"{depth:#x}","calls":["#
            ));
        }
        trace.push_str(r#"{"type":"CALL","from":"0x0000000000000000000000000000000000000001","value":"0x400"}"#);
        trace.push_str(&"]}".repeat(1024));

        let record = serde_json::to_string(&tx(7)).expect("record serializes");
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let path = dir.path().join("deep.json");
        std::fs::write(
            &path,
            format!(r#"{{"transactions":[{{"transaction":{record},"trace":{trace}}}]}}"#),
        )
        .expect("fixture should write");

        let source = FixtureSource::load(&path).expect("deep fixture should load");
        let Capture::Captured(root) = source.call_trace(B256::with_last_byte(7)).await else {
            panic!("trace should replay");
        };
        let mut depth = 0;
        let mut node = &root;
        while let Some(child) = node.calls.first() {
            node = child;
            depth += 1;
        }
        assert_eq!(depth, 1024);
        assert_eq!(node.value_wei(), U256::from(1024));
    }
}
