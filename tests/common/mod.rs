//! Shared test helpers and utilities.
//!
//! Factories for raw chain records with sensible defaults, plus a helper that
//! runs the pipeline over an in-memory sink.

#![allow(dead_code)]

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolValue;
use evidence_data::fixture::{FixtureSource, FixtureTransaction};
use evidence_data::sink::MemorySink;
use evidence_data::types::{CallKind, CallTraceNode, LogRecord, TransactionRecord, TxStatus};
use evidence_derive::decoder::{APPROVAL_TOPIC, TRANSFER_FROM_SELECTOR, TRANSFER_TOPIC};
use evidence_derive::{Pipeline, PipelineConfig, RunSummary};

/// Address whose last byte is `n`; readable stand-in for real accounts.
pub fn addr(n: u8) -> Address {
    Address::with_last_byte(n)
}

/// Lowercase hex form used in every output record.
pub fn hex(address: Address) -> String {
    address.to_string().to_lowercase()
}

/// Creates a successful plain transfer transaction with sensible defaults.
///
/// Block number is `100 + n`, timestamps advance 12 seconds per block.
pub fn sample_tx(n: u8, from: Address, to: Address, value: u64) -> TransactionRecord {
    TransactionRecord {
        hash: B256::with_last_byte(n),
        from,
        to: Some(to),
        value: U256::from(value),
        input: Bytes::new(),
        gas_used: 21_000,
        gas_price: U256::from(1_000_000_000u64), // 1 gwei
        status: TxStatus::Success,
        block_number: 100 + u64::from(n),
        block_timestamp: 1_708_617_600 + u64::from(n) * 12,
        tx_index: 0,
        contract_address: None,
        revert_reason: None,
    }
}

/// Same as [`sample_tx`] but calling `transferFrom` on `token`.
pub fn transfer_from_tx(n: u8, spender: Address, token: Address) -> TransactionRecord {
    let mut tx = sample_tx(n, spender, token, 0);
    let mut input = TRANSFER_FROM_SELECTOR.to_vec();
    input.extend_from_slice(&[0u8; 96]);
    tx.input = input.into();
    tx.gas_used = 60_000;
    tx
}

fn indexed_log(signature: B256, token: Address, a: Address, b: Address, amount: u64, index: u64) -> LogRecord {
    LogRecord {
        address: token,
        topics: vec![signature, a.into_word(), b.into_word()],
        data: U256::from(amount).abi_encode().into(),
        log_index: index,
    }
}

/// Token Transfer log of `amount` units of `token`.
pub fn transfer_log(token: Address, from: Address, to: Address, amount: u64, index: u64) -> LogRecord {
    indexed_log(TRANSFER_TOPIC, token, from, to, amount, index)
}

/// Token Approval log granting `spender` `amount` units of `token`.
pub fn approval_log(token: Address, owner: Address, spender: Address, amount: u64, index: u64) -> LogRecord {
    indexed_log(APPROVAL_TOPIC, token, owner, spender, amount, index)
}

/// Call frame moving `value` wei, with nested `calls`.
pub fn call_frame(from: Address, to: Address, value: u64, calls: Vec<CallTraceNode>) -> CallTraceNode {
    CallTraceNode {
        kind: CallKind::Call,
        from,
        to: Some(to),
        value: (value > 0).then(|| U256::from(value)),
        input: Bytes::new(),
        output: None,
        error: None,
        revert_reason: None,
        calls,
    }
}

/// Runs the pipeline over `transactions` in order and returns the sink.
///
/// # Panics
/// Panics if the run fails; fetch failures are not run failures.
pub async fn run_fixture(transactions: Vec<FixtureTransaction>) -> (RunSummary, MemorySink) {
    let source = FixtureSource::new(transactions);
    let hashes = source.hashes();
    let mut pipeline = Pipeline::new(source, MemorySink::new(), PipelineConfig::new("it-run"));
    let summary = pipeline.run(&hashes).await.expect("pipeline run should succeed");
    (summary, pipeline.into_sink())
}

/// Decimal-string amount field parsed back into a U256.
pub fn amount(value: &serde_json::Value) -> U256 {
    value
        .as_str()
        .and_then(|s| s.parse::<U256>().ok())
        .expect("amount should be a decimal string")
}
