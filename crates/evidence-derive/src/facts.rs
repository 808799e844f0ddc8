//! Derived fact records and their output streams.
//!
//! One struct per fact kind, wrapped in the tagged [`Fact`] enum. Every
//! record is written with a `fact_type` discriminator and the `run_id` of the
//! run that produced it. Amounts are decimal strings, addresses lowercase hex.

use alloy::primitives::{Address, Selector, B256, U256};
use evidence_data::sink::{EmptyMeaning, StreamSpec};
use evidence_data::types::TransactionRecord;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::profile::{AddressProfileRecord, MethodStatRecord};

/// Block number and timestamp shared by every per-transaction fact.
///
/// Orders by block number first, then timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockMoment {
    pub block_number: u64,
    pub timestamp: u64,
}

impl BlockMoment {
    pub fn of(tx: &TransactionRecord) -> Self {
        Self {
            block_number: tx.block_number,
            timestamp: tx.block_timestamp,
        }
    }
}

impl Serialize for BlockMoment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("BlockMoment", 3)?;
        s.serialize_field("block_number", &self.block_number)?;
        s.serialize_field("timestamp", &self.timestamp)?;
        s.serialize_field("timestamp_iso", &iso8601(self.timestamp))?;
        s.end()
    }
}

pub(crate) fn iso8601(unix_secs: u64) -> Option<String> {
    let secs = i64::try_from(unix_secs).ok()?;
    chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.to_rfc3339())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Native,
    Token,
}

/// What was moved: the chain's native coin or a token contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Asset {
    Native,
    Token(Address),
}

impl Asset {
    pub fn kind(self) -> AssetKind {
        match self {
            Self::Native => AssetKind::Native,
            Self::Token(_) => AssetKind::Token,
        }
    }

    pub fn token(self) -> Option<Address> {
        match self {
            Self::Native => None,
            Self::Token(token) => Some(token),
        }
    }
}

impl Serialize for Asset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Native => serializer.serialize_str("native"),
            Self::Token(token) => serializer.serialize_str(&ser::lower(token)),
        }
    }
}

/// Where a value movement was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOrigin {
    /// The transaction's own value field.
    TxValue,
    /// A decoded token Transfer log.
    Log,
    /// A value-carrying frame of the call trace.
    Trace,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssetTransferFact {
    pub tx_hash: B256,
    #[serde(flatten)]
    pub at: BlockMoment,
    pub asset_kind: AssetKind,
    pub asset: Asset,
    #[serde(serialize_with = "ser::address")]
    pub from: Address,
    #[serde(serialize_with = "ser::address")]
    pub to: Address,
    #[serde(serialize_with = "ser::decimal")]
    pub amount: U256,
    pub origin: TransferOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_index: Option<u64>,
    /// Call depth below the root frame, for trace-derived movements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

impl AssetTransferFact {
    pub fn is_native(&self) -> bool {
        self.asset == Asset::Native
    }

    /// Graph-edge projection of this transfer.
    pub fn edge(&self) -> FundFlowEdge {
        FundFlowEdge {
            source: self.from,
            target: self.to,
            asset: self.asset,
            asset_kind: self.asset_kind,
            amount: self.amount,
            tx_hash: self.tx_hash,
            at: self.at,
            origin: self.origin,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FundFlowEdge {
    #[serde(serialize_with = "ser::address")]
    pub source: Address,
    #[serde(serialize_with = "ser::address")]
    pub target: Address,
    pub asset: Asset,
    pub asset_kind: AssetKind,
    #[serde(serialize_with = "ser::decimal")]
    pub amount: U256,
    pub tx_hash: B256,
    #[serde(flatten)]
    pub at: BlockMoment,
    pub origin: TransferOrigin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApprovalFact {
    #[serde(serialize_with = "ser::address")]
    pub token: Address,
    #[serde(serialize_with = "ser::address")]
    pub owner: Address,
    #[serde(serialize_with = "ser::address")]
    pub spender: Address,
    #[serde(serialize_with = "ser::decimal")]
    pub amount: U256,
    pub tx_hash: B256,
    pub log_index: u64,
    #[serde(flatten)]
    pub at: BlockMoment,
}

impl ApprovalFact {
    /// Directed owner -> spender projection.
    pub fn edge(&self) -> AllowanceEdge {
        AllowanceEdge {
            source: self.owner,
            target: self.spender,
            token: self.token,
            amount: self.amount,
            tx_hash: self.tx_hash,
            log_index: self.log_index,
            at: self.at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AllowanceEdge {
    #[serde(serialize_with = "ser::address")]
    pub source: Address,
    #[serde(serialize_with = "ser::address")]
    pub target: Address,
    #[serde(serialize_with = "ser::address")]
    pub token: Address,
    #[serde(serialize_with = "ser::decimal")]
    pub amount: U256,
    pub tx_hash: B256,
    pub log_index: u64,
    #[serde(flatten)]
    pub at: BlockMoment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AllowanceUsageFact {
    #[serde(serialize_with = "ser::address")]
    pub token: Address,
    #[serde(serialize_with = "ser::address")]
    pub owner: Address,
    #[serde(serialize_with = "ser::address")]
    pub spender: Address,
    #[serde(serialize_with = "ser::decimal")]
    pub approved_amount: U256,
    #[serde(serialize_with = "ser::decimal")]
    pub used_amount: U256,
    pub approval_tx_hash: B256,
    pub usage_tx_hash: B256,
    /// Block and time of the usage transaction.
    #[serde(flatten)]
    pub at: BlockMoment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TxEnrichedFact {
    pub tx_hash: B256,
    #[serde(flatten)]
    pub at: BlockMoment,
    pub tx_index: u64,
    #[serde(serialize_with = "ser::address")]
    pub from: Address,
    #[serde(serialize_with = "ser::opt_address")]
    pub to: Option<Address>,
    #[serde(serialize_with = "ser::opt_address")]
    pub contract_created: Option<Address>,
    #[serde(serialize_with = "ser::decimal")]
    pub value_wei: U256,
    pub gas_used: u64,
    #[serde(serialize_with = "ser::decimal")]
    pub gas_price_wei: U256,
    #[serde(serialize_with = "ser::decimal")]
    pub fee_wei: U256,
    pub status: &'static str,
    pub selector: Option<Selector>,
    pub method: Option<&'static str>,
    pub log_count: usize,
    pub token_transfer_count: usize,
    pub approval_count: usize,
    pub internal_transfer_count: usize,
    pub trace_status: &'static str,
    pub prestate_status: &'static str,
    pub revert_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContractCallFact {
    pub tx_hash: B256,
    #[serde(flatten)]
    pub at: BlockMoment,
    #[serde(serialize_with = "ser::address")]
    pub from: Address,
    #[serde(serialize_with = "ser::address")]
    pub to: Address,
    pub selector: Selector,
    pub method: Option<&'static str>,
    #[serde(serialize_with = "ser::decimal")]
    pub value_wei: U256,
    pub status: &'static str,
    pub gas_used: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TraceEdgeFact {
    pub tx_hash: B256,
    #[serde(flatten)]
    pub at: BlockMoment,
    /// Pre-order position of the frame within the call tree.
    pub frame_index: usize,
    pub depth: u32,
    pub call_kind: &'static str,
    #[serde(serialize_with = "ser::address")]
    pub caller: Address,
    #[serde(serialize_with = "ser::opt_address")]
    pub callee: Option<Address>,
    #[serde(serialize_with = "ser::decimal")]
    pub value_wei: U256,
    pub selector: Option<Selector>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertSource {
    /// Human-readable reason reported by the call tracer.
    Trace,
    /// Reason field on the receipt.
    Receipt,
    /// ABI-decoded `Error(string)` payload.
    ErrorString,
    /// ABI-decoded `Panic(uint256)` payload.
    PanicCode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RevertReasonFact {
    pub tx_hash: B256,
    #[serde(flatten)]
    pub at: BlockMoment,
    #[serde(serialize_with = "ser::address")]
    pub from: Address,
    #[serde(serialize_with = "ser::opt_address")]
    pub to: Option<Address>,
    pub selector: Option<Selector>,
    pub reason: String,
    pub source: RevertSource,
}

/// Capture mode of a state-diff record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Only pre-call values are available; post-call fields are always null.
    PrestateOnly,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StateDiffFact {
    pub tx_hash: B256,
    #[serde(flatten)]
    pub at: BlockMoment,
    pub mode: CaptureMode,
    #[serde(serialize_with = "ser::address")]
    pub address: Address,
    #[serde(serialize_with = "ser::opt_decimal")]
    pub balance_before: Option<U256>,
    #[serde(serialize_with = "ser::opt_decimal")]
    pub balance_after: Option<U256>,
    pub nonce_before: Option<u64>,
    pub has_code: bool,
    pub storage_before: std::collections::BTreeMap<B256, B256>,
    pub storage_after: Option<std::collections::BTreeMap<B256, B256>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub tx_hash: B256,
    pub error: String,
    pub failed_at: String,
}

/// Every record kind the pipeline emits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "fact_type", rename_all = "snake_case")]
pub enum Fact {
    AssetTransfer(AssetTransferFact),
    InternalNativeTransfer(AssetTransferFact),
    FundFlowEdge(FundFlowEdge),
    TxEnriched(TxEnrichedFact),
    ContractCall(ContractCallFact),
    AddressProfile(AddressProfileRecord),
    MethodStat(MethodStatRecord),
    TraceEdge(TraceEdgeFact),
    RevertReason(RevertReasonFact),
    Approval(ApprovalFact),
    AllowanceEdge(AllowanceEdge),
    AllowanceUsage(AllowanceUsageFact),
    StateDiff(StateDiffFact),
    FetchFailure(FetchFailure),
}

impl Fact {
    /// Name of the output stream this fact belongs to (equal to its `fact_type`).
    pub fn stream(&self) -> &'static str {
        match self {
            Self::AssetTransfer(_) => ASSET_TRANSFER.name,
            Self::InternalNativeTransfer(_) => INTERNAL_NATIVE_TRANSFER.name,
            Self::FundFlowEdge(_) => FUND_FLOW_EDGE.name,
            Self::TxEnriched(_) => TX_ENRICHED.name,
            Self::ContractCall(_) => CONTRACT_CALL.name,
            Self::AddressProfile(_) => ADDRESS_PROFILE.name,
            Self::MethodStat(_) => METHOD_STAT.name,
            Self::TraceEdge(_) => TRACE_EDGE.name,
            Self::RevertReason(_) => REVERT_REASON.name,
            Self::Approval(_) => APPROVAL.name,
            Self::AllowanceEdge(_) => ALLOWANCE_EDGE.name,
            Self::AllowanceUsage(_) => ALLOWANCE_USAGE.name,
            Self::StateDiff(_) => STATE_DIFF.name,
            Self::FetchFailure(_) => FETCH_FAILURE.name,
        }
    }

    /// Serializes the fact as one JSON line stamped with `run_id`.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json_line(&self, run_id: &str) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            run_id: &'a str,
            #[serde(flatten)]
            fact: &'a Fact,
        }
        serde_json::to_string(&Envelope { run_id, fact: self })
    }
}

pub const ASSET_TRANSFER: StreamSpec = StreamSpec {
    name: "asset_transfer",
    description: "native value moved by a transaction's value field, or a decoded token Transfer log",
    when_empty: EmptyMeaning::ExpectedEmpty("no successful transaction moved value or tokens"),
};
pub const INTERNAL_NATIVE_TRANSFER: StreamSpec = StreamSpec {
    name: "internal_native_transfer",
    description: "native value moved by a nested call frame (depth >= 1) of a call trace",
    when_empty: EmptyMeaning::KnownLimitation(
        "empty when the backend has no call tracer, or no nested frame carried value",
    ),
};
pub const FUND_FLOW_EDGE: StreamSpec = StreamSpec {
    name: "fund_flow_edge",
    description: "graph-edge projection of every asset_transfer and internal_native_transfer",
    when_empty: EmptyMeaning::ExpectedEmpty("no value moved"),
};
pub const TX_ENRICHED: StreamSpec = StreamSpec {
    name: "tx_enriched",
    description: "one record per successfully fetched transaction",
    when_empty: EmptyMeaning::ExpectedEmpty("the transaction set was empty or every fetch failed"),
};
pub const CONTRACT_CALL: StreamSpec = StreamSpec {
    name: "contract_call",
    description: "top-level call carrying a 4-byte method selector",
    when_empty: EmptyMeaning::ExpectedEmpty("no transaction called a contract method"),
};
pub const ADDRESS_PROFILE: StreamSpec = StreamSpec {
    name: "address_profile",
    description: "end-of-run activity aggregate per address",
    when_empty: EmptyMeaning::ExpectedEmpty("no transaction was processed"),
};
pub const METHOD_STAT: StreamSpec = StreamSpec {
    name: "method_stat",
    description: "end-of-run aggregate per (contract, selector)",
    when_empty: EmptyMeaning::ExpectedEmpty("no contract method was called"),
};
pub const TRACE_EDGE: StreamSpec = StreamSpec {
    name: "trace_edge",
    description: "one call frame of a transaction call tree",
    when_empty: EmptyMeaning::KnownLimitation("the backend provides no call tracer"),
};
pub const REVERT_REASON: StreamSpec = StreamSpec {
    name: "revert_reason",
    description: "decoded reason of a reverted transaction",
    when_empty: EmptyMeaning::ExpectedEmpty("no transaction reverted with a decodable reason"),
};
pub const APPROVAL: StreamSpec = StreamSpec {
    name: "approval",
    description: "decoded token Approval log",
    when_empty: EmptyMeaning::ExpectedEmpty("no approvals were granted"),
};
pub const ALLOWANCE_EDGE: StreamSpec = StreamSpec {
    name: "allowance_edge",
    description: "owner -> spender projection of every approval",
    when_empty: EmptyMeaning::ExpectedEmpty("no approvals were granted"),
};
pub const ALLOWANCE_USAGE: StreamSpec = StreamSpec {
    name: "allowance_usage",
    description: "transferFrom matched to the approval it spent",
    when_empty: EmptyMeaning::ExpectedEmpty("no transferFrom spent a previously recorded approval"),
};
pub const STATE_DIFF: StreamSpec = StreamSpec {
    name: "state_diff",
    description: "pre-call account state (prestate-only mode, post-call fields always null)",
    when_empty: EmptyMeaning::KnownLimitation("the backend provides no prestate tracer"),
};
pub const FETCH_FAILURE: StreamSpec = StreamSpec {
    name: "fetch_failure",
    description: "transaction whose data could not be fetched; skipped by the run",
    when_empty: EmptyMeaning::ExpectedEmpty("every transaction was fetched"),
};

/// All streams a run creates, in manifest order.
pub const STREAMS: &[StreamSpec] = &[
    ASSET_TRANSFER,
    FUND_FLOW_EDGE,
    INTERNAL_NATIVE_TRANSFER,
    TX_ENRICHED,
    CONTRACT_CALL,
    ADDRESS_PROFILE,
    METHOD_STAT,
    TRACE_EDGE,
    REVERT_REASON,
    APPROVAL,
    ALLOWANCE_EDGE,
    ALLOWANCE_USAGE,
    STATE_DIFF,
    FETCH_FAILURE,
];

pub(crate) mod ser {
    use std::collections::{BTreeMap, BTreeSet};

    use alloy::primitives::{Address, U256};
    use serde::ser::{SerializeMap, SerializeSeq};
    use serde::Serializer;

    pub fn lower(address: &Address) -> String {
        address.to_string().to_lowercase()
    }

    pub fn address<S: Serializer>(address: &Address, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&lower(address))
    }

    pub fn opt_address<S: Serializer>(address: &Option<Address>, s: S) -> Result<S::Ok, S::Error> {
        match address {
            Some(address) => s.serialize_str(&lower(address)),
            None => s.serialize_none(),
        }
    }

    pub fn decimal<S: Serializer>(value: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(value)
    }

    pub fn opt_decimal<S: Serializer>(value: &Option<U256>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => s.collect_str(value),
            None => s.serialize_none(),
        }
    }

    pub fn decimal_map<S: Serializer>(
        map: &BTreeMap<Address, U256>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = s.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(&lower(key), &value.to_string())?;
        }
        out.end()
    }

    pub fn address_set<S: Serializer>(set: &BTreeSet<Address>, s: S) -> Result<S::Ok, S::Error> {
        let mut out = s.serialize_seq(Some(set.len()))?;
        for address in set {
            out.serialize_element(&lower(address))?;
        }
        out.end()
    }
}
