//! Raw chain records consumed by the derivation pipeline.
//!
//! These mirror what an execution backend hands back for one mined
//! transaction: the transaction merged with its receipt, the receipt logs,
//! and the best-effort tracer outputs (call tree, prestate).

use std::collections::BTreeMap;

use alloy::primitives::{Address, Bytes, Selector, B256, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Execution status from the receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Success,
    Revert,
}

impl TxStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Revert => "revert",
        }
    }
}

/// One mined transaction, merged with the fields of its receipt and block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction hash.
    pub hash: B256,
    /// Sender.
    pub from: Address,
    /// Recipient (None for contract creation).
    pub to: Option<Address>,
    /// Native value in wei.
    pub value: U256,
    /// Calldata.
    pub input: Bytes,
    /// Gas used (from the receipt).
    pub gas_used: u64,
    /// Effective gas price in wei.
    pub gas_price: U256,
    /// Execution status (from the receipt).
    pub status: TxStatus,
    /// Block number.
    pub block_number: u64,
    /// Block timestamp in unix seconds.
    pub block_timestamp: u64,
    /// Transaction index within the block.
    pub tx_index: u64,
    /// Address of the created contract, for creations.
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// Receipt-supplied revert reason, on backends that expose one.
    #[serde(default)]
    pub revert_reason: Option<String>,
}

impl TransactionRecord {
    /// 4-byte method selector, if the calldata is long enough to carry one.
    pub fn selector(&self) -> Option<Selector> {
        selector_of(&self.input)
    }

    /// Total fee paid in wei.
    pub fn fee_wei(&self) -> U256 {
        U256::from(self.gas_used).saturating_mul(self.gas_price)
    }
}

/// Receipt log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Contract that emitted the log.
    pub address: Address,
    /// Topic hashes (0 to 4).
    pub topics: Vec<B256>,
    /// Non-indexed payload.
    pub data: Bytes,
    /// Index of the log within the receipt.
    pub log_index: u64,
}

/// Call frame kind as reported by the call tracer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallKind {
    Call,
    #[serde(rename = "DELEGATECALL")]
    DelegateCall,
    #[serde(rename = "STATICCALL")]
    StaticCall,
    #[serde(rename = "CALLCODE")]
    CallCode,
    Create,
    Create2,
    #[serde(rename = "SELFDESTRUCT")]
    SelfDestruct,
    #[serde(other)]
    Other,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::DelegateCall => "delegatecall",
            Self::StaticCall => "staticcall",
            Self::CallCode => "callcode",
            Self::Create => "create",
            Self::Create2 => "create2",
            Self::SelfDestruct => "selfdestruct",
            Self::Other => "other",
        }
    }

    /// Parity-style `action.callType` / `type` names.
    pub fn from_parity(name: &str) -> Self {
        match name {
            "call" => Self::Call,
            "delegatecall" => Self::DelegateCall,
            "staticcall" => Self::StaticCall,
            "callcode" => Self::CallCode,
            "create" => Self::Create,
            "create2" => Self::Create2,
            "suicide" | "selfdestruct" => Self::SelfDestruct,
            _ => Self::Other,
        }
    }
}

/// One node of a transaction call tree.
///
/// Field names follow the geth `callTracer` output so a tracer response
/// deserializes straight into this type.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTraceNode {
    #[serde(rename = "type")]
    pub kind: CallKind,
    /// Caller.
    pub from: Address,
    /// Callee (absent for failed creations).
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default)]
    pub output: Option<Bytes>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub revert_reason: Option<String>,
    #[serde(default)]
    pub calls: Vec<CallTraceNode>,
}

impl CallTraceNode {
    pub fn value_wei(&self) -> U256 {
        self.value.unwrap_or(U256::ZERO)
    }

    pub fn selector(&self) -> Option<Selector> {
        selector_of(&self.input)
    }
}

impl CallTraceNode {
    fn with_calls(&self, calls: Vec<CallTraceNode>) -> Self {
        Self {
            kind: self.kind,
            from: self.from,
            to: self.to,
            value: self.value,
            input: self.input.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            revert_reason: self.revert_reason.clone(),
            calls,
        }
    }
}

impl Clone for CallTraceNode {
    fn clone(&self) -> Self {
        // (source frame, children cloned so far)
        let mut stack: Vec<(&Self, Vec<Self>)> = vec![(self, Vec::new())];
        let mut finished = None;
        while let Some((src, calls)) = stack.pop() {
            if let Some(child) = src.calls.get(calls.len()) {
                stack.push((src, calls));
                stack.push((child, Vec::with_capacity(child.calls.len())));
                continue;
            }
            let node = src.with_calls(calls);
            match stack.last_mut() {
                Some((_, siblings)) => siblings.push(node),
                None => finished = Some(node),
            }
        }
        finished.unwrap_or_else(|| self.with_calls(Vec::new()))
    }
}

impl Drop for CallTraceNode {
    // The EVM allows 1024 nested frames; unwind children with a worklist
    // instead of recursing through the default drop glue.
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.calls);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.calls);
        }
    }
}

/// Pre-transaction state of one touched account.
///
/// Only pre-call values are obtainable from the prestate tracer; there is no
/// post-call counterpart on this type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrestateSnapshot {
    pub address: Address,
    pub balance_before: Option<U256>,
    pub nonce_before: Option<u64>,
    /// Whether the account had code before the call.
    #[serde(default)]
    pub has_code: bool,
    #[serde(default)]
    pub storage_before: BTreeMap<B256, B256>,
}

/// Everything fetched for one transaction hash apart from tracer output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchedTransaction {
    pub transaction: TransactionRecord,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
}

pub(crate) fn selector_of(input: &[u8]) -> Option<Selector> {
    input.get(..4).map(Selector::from_slice)
}

/// Parses tracer JSON without serde_json's nesting limit.
///
/// A call tree costs two nesting levels per frame, so the default limit of
/// 128 rejects anything deeper than 63 frames. The stack grows on demand
/// while the nested frames deserialize.
///
/// # Errors
/// Returns error if `json` is malformed or does not match `T`.
pub fn from_json_unbounded<T: DeserializeOwned>(json: &str) -> serde_json::Result<T> {
    let mut de = serde_json::Deserializer::from_str(json);
    de.disable_recursion_limit();
    let value = T::deserialize(serde_stacker::Deserializer::new(&mut de))?;
    de.end()?;
    Ok(value)
}
