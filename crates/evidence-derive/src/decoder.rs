//! Stateless decoders from raw chain records to facts.
//!
//! Token events and calls are described with `alloy::sol!` so selectors and
//! topic hashes are computed at compile time. Every decoder is pure: the same
//! input always yields the same output, and malformed input yields nothing
//! rather than an error.

use alloy::primitives::{Address, Selector, B256, U256};
use alloy::sol_types::{Panic, Revert, SolCall, SolError, SolEvent};
use evidence_data::types::{CallKind, CallTraceNode, LogRecord, TransactionRecord};

use crate::facts::{
    ApprovalFact, Asset, AssetKind, AssetTransferFact, BlockMoment, RevertSource, TraceEdgeFact,
    TransferOrigin,
};

/// Compile-time ABI definitions for the fungible token standard.
pub mod erc20 {
    use alloy::sol;

    sol! {
        interface IERC20 {
            event Transfer(address indexed from, address indexed to, uint256 value);
            event Approval(address indexed owner, address indexed spender, uint256 value);

            function transfer(address to, uint256 amount) external returns (bool);
            function approve(address spender, uint256 amount) external returns (bool);
            function transferFrom(address from, address to, uint256 amount) external returns (bool);
            function increaseAllowance(address spender, uint256 addedValue) external returns (bool);
            function decreaseAllowance(address spender, uint256 subtractedValue) external returns (bool);
        }
    }
}

use erc20::IERC20;

/// Topic 0 of a token Transfer event.
pub const TRANSFER_TOPIC: B256 = IERC20::Transfer::SIGNATURE_HASH;
/// Topic 0 of a token Approval event.
pub const APPROVAL_TOPIC: B256 = IERC20::Approval::SIGNATURE_HASH;
/// Selector of `transferFrom(address,address,uint256)`.
pub const TRANSFER_FROM_SELECTOR: Selector = Selector::new(IERC20::transferFromCall::SELECTOR);

/// Human-readable name for the selectors this crate knows about.
pub fn method_name(selector: Selector) -> Option<&'static str> {
    match selector.0 {
        IERC20::transferCall::SELECTOR => Some("transfer"),
        IERC20::approveCall::SELECTOR => Some("approve"),
        IERC20::transferFromCall::SELECTOR => Some("transferFrom"),
        IERC20::increaseAllowanceCall::SELECTOR => Some("increaseAllowance"),
        IERC20::decreaseAllowanceCall::SELECTOR => Some("decreaseAllowance"),
        _ => None,
    }
}

/// Splits a Transfer/Approval shaped log into its two indexed addresses and
/// the amount word.
///
/// Requires exactly three topics with the expected signature and a non-empty
/// data payload. Only the first 32 bytes of data are read.
fn indexed_pair(log: &LogRecord, signature: B256) -> Option<(Address, Address, U256)> {
    if log.topics.len() != 3 || log.topics[0] != signature || log.data.is_empty() {
        return None;
    }
    let first = Address::from_word(log.topics[1]);
    let second = Address::from_word(log.topics[2]);
    let word = &log.data[..log.data.len().min(32)];
    let amount = U256::try_from_be_slice(word)?;
    Some((first, second, amount))
}

/// Decodes a token Transfer log emitted by `tx`.
pub fn decode_token_transfer(tx: &TransactionRecord, log: &LogRecord) -> Option<AssetTransferFact> {
    let (from, to, amount) = indexed_pair(log, TRANSFER_TOPIC)?;
    Some(AssetTransferFact {
        tx_hash: tx.hash,
        at: BlockMoment::of(tx),
        asset_kind: AssetKind::Token,
        asset: Asset::Token(log.address),
        from,
        to,
        amount,
        origin: TransferOrigin::Log,
        log_index: Some(log.log_index),
        depth: None,
    })
}

/// Decodes a token Approval log emitted by `tx`.
pub fn decode_approval(tx: &TransactionRecord, log: &LogRecord) -> Option<ApprovalFact> {
    let (owner, spender, amount) = indexed_pair(log, APPROVAL_TOPIC)?;
    Some(ApprovalFact {
        token: log.address,
        owner,
        spender,
        amount,
        tx_hash: tx.hash,
        log_index: log.log_index,
        at: BlockMoment::of(tx),
    })
}

/// Native transfer carried by the transaction's own value field.
///
/// Only successful transactions move value; reverted ones yield nothing.
pub fn decode_tx_value(tx: &TransactionRecord) -> Option<AssetTransferFact> {
    if tx.value.is_zero() || !tx.status.is_success() {
        return None;
    }
    let to = tx.to.or(tx.contract_address)?;
    Some(AssetTransferFact {
        tx_hash: tx.hash,
        at: BlockMoment::of(tx),
        asset_kind: AssetKind::Native,
        asset: Asset::Native,
        from: tx.from,
        to,
        amount: tx.value,
        origin: TransferOrigin::TxValue,
        log_index: None,
        depth: None,
    })
}

/// Pre-order walk of a call tree that yields `(frame_index, depth, node)`.
///
/// Uses an explicit stack so arbitrarily deep trees cannot overflow the
/// thread stack.
pub struct CallTreeWalk<'a> {
    stack: Vec<(&'a CallTraceNode, u32)>,
    next_index: usize,
    prune_failed: bool,
}

impl<'a> CallTreeWalk<'a> {
    /// Starts at `root`, which is yielded first with index 0 and depth 0.
    pub fn new(root: &'a CallTraceNode) -> Self {
        Self {
            stack: vec![(root, 0)],
            next_index: 0,
            prune_failed: false,
        }
    }

    /// Skips the children of frames that reported an error.
    pub fn prune_failed(mut self) -> Self {
        self.prune_failed = true;
        self
    }
}

impl<'a> Iterator for CallTreeWalk<'a> {
    type Item = (usize, u32, &'a CallTraceNode);

    fn next(&mut self) -> Option<Self::Item> {
        let (node, depth) = self.stack.pop()?;
        if !(self.prune_failed && node.error.is_some()) {
            self.stack
                .extend(node.calls.iter().rev().map(|child| (child, depth + 1)));
        }
        let index = self.next_index;
        self.next_index += 1;
        Some((index, depth, node))
    }
}

/// Whether a frame of this kind actually moves its `value` field.
fn moves_value(kind: CallKind) -> bool {
    !matches!(kind, CallKind::DelegateCall | CallKind::StaticCall)
}

/// Native value movements found in a call tree, in pre-order.
///
/// Includes the root frame at depth 0. Frames that failed, and everything
/// below them, are skipped since their value movement was rolled back.
pub fn decode_internal_value_transfers(
    tx: &TransactionRecord,
    root: &CallTraceNode,
) -> Vec<AssetTransferFact> {
    CallTreeWalk::new(root)
        .prune_failed()
        .filter(|(_, _, node)| node.error.is_none() && moves_value(node.kind))
        .filter_map(|(_, depth, node)| {
            let amount = node.value_wei();
            if amount.is_zero() {
                return None;
            }
            Some(AssetTransferFact {
                tx_hash: tx.hash,
                at: BlockMoment::of(tx),
                asset_kind: AssetKind::Native,
                asset: Asset::Native,
                from: node.from,
                to: node.to?,
                amount,
                origin: TransferOrigin::Trace,
                log_index: None,
                depth: Some(depth),
            })
        })
        .collect()
}

/// One edge per call frame, failed frames included.
pub fn trace_edges(tx: &TransactionRecord, root: &CallTraceNode) -> Vec<TraceEdgeFact> {
    CallTreeWalk::new(root)
        .map(|(frame_index, depth, node)| TraceEdgeFact {
            tx_hash: tx.hash,
            at: BlockMoment::of(tx),
            frame_index,
            depth,
            call_kind: node.kind.as_str(),
            caller: node.from,
            callee: node.to,
            value_wei: node.value_wei(),
            selector: node.selector(),
            error: node.error.clone(),
        })
        .collect()
}

/// A decoded revert reason and where it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevertReason {
    pub reason: String,
    pub source: RevertSource,
}

impl RevertReason {
    fn new(reason: impl Into<String>, source: RevertSource) -> Self {
        Self {
            reason: reason.into(),
            source,
        }
    }
}

/// Resolves a human-readable revert reason.
///
/// Precedence: the tracer's reason, then the receipt's reason, then an
/// ABI-decoded `Error(string)` in `output`, then a `Panic(uint256)` code.
/// Blank reasons count as absent.
pub fn decode_revert_reason(
    output: Option<&[u8]>,
    trace_reason: Option<&str>,
    receipt_reason: Option<&str>,
) -> Option<RevertReason> {
    fn present(reason: Option<&str>) -> Option<&str> {
        reason.map(str::trim).filter(|r| !r.is_empty())
    }

    if let Some(reason) = present(trace_reason) {
        return Some(RevertReason::new(reason, RevertSource::Trace));
    }
    if let Some(reason) = present(receipt_reason) {
        return Some(RevertReason::new(reason, RevertSource::Receipt));
    }

    let output = output?;
    let selector = output.get(..4)?;
    if selector == Revert::SELECTOR {
        let revert = Revert::abi_decode(output, false).ok()?;
        return Some(RevertReason::new(revert.reason, RevertSource::ErrorString));
    }
    if selector == Panic::SELECTOR {
        let panic = Panic::abi_decode(output, false).ok()?;
        return Some(RevertReason::new(
            panic_name(panic.code),
            RevertSource::PanicCode,
        ));
    }
    None
}

/// Solidity panic code name, or the decimal code when unknown.
pub fn panic_name(code: U256) -> String {
    let name = match u64::try_from(code) {
        Ok(0x01) => "ASSERTION_FAILED",
        Ok(0x11) => "ARITHMETIC_OVERFLOW",
        Ok(0x12) => "DIVISION_BY_ZERO",
        Ok(0x21) => "INVALID_ENUM_VALUE",
        Ok(0x22) => "INVALID_STORAGE_ENCODING",
        Ok(0x41) => "OUT_OF_MEMORY",
        Ok(0x51) => "ZERO_INITIALIZED_FUNCTION",
        _ => return code.to_string(),
    };
    name.to_string()
}
