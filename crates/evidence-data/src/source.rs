//! The seam between the derivation pipeline and whatever backend produced
//! the chain data.
//!
//! Implementations: [`crate::rpc::RpcSource`] (live JSON-RPC endpoint) and
//! [`crate::fixture::FixtureSource`] (recorded JSON, used for replay and tests).

use alloy::primitives::{Address, Bytes, B256, U256};
use eyre::Result;

use crate::types::{CallTraceNode, FetchedTransaction, PrestateSnapshot};

/// Outcome of a best-effort tracer query.
///
/// Keeps "the backend cannot do this" apart from "the call failed", so a
/// caller can decide on retries without string-matching errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Capture<T> {
    /// The tracer ran and produced a result.
    Captured(T),
    /// The backend does not implement the tracer (or returned nothing).
    Unsupported,
    /// Every attempt failed with a transport or backend error.
    Failed(String),
}

impl<T> Capture<T> {
    pub fn captured(self) -> Option<T> {
        match self {
            Self::Captured(value) => Some(value),
            Self::Unsupported | Self::Failed(_) => None,
        }
    }

    /// Short status label used in enriched transaction facts.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Captured(_) => "captured",
            Self::Unsupported => "unsupported",
            Self::Failed(_) => "failed",
        }
    }
}

/// Per-transaction accessors over an already-mined transaction set.
///
/// Every method is a potential suspension point. Implementations hold no
/// locks across awaits; the pipeline mutates its own state only after a
/// fetch has resolved.
#[allow(async_fn_in_trait)]
pub trait ChainSource {
    /// Transaction, receipt, logs and block timestamp for one hash.
    ///
    /// # Errors
    /// Returns error if any of the underlying lookups fail or the
    /// transaction is unknown.
    async fn fetch_transaction(&self, hash: B256) -> Result<FetchedTransaction>;

    /// Best-effort call tree for one transaction.
    async fn call_trace(&self, hash: B256) -> Capture<CallTraceNode>;

    /// Best-effort prestate of every account touched by one transaction.
    async fn prestate(&self, hash: B256) -> Capture<Vec<PrestateSnapshot>>;

    /// Native balance of `address` at the end of `block`.
    ///
    /// # Errors
    /// Returns error if the lookup fails.
    async fn balance_at(&self, address: Address, block: u64) -> Result<U256>;

    /// Deployed code at `address` (empty for externally owned accounts).
    ///
    /// # Errors
    /// Returns error if the lookup fails.
    async fn code_at(&self, address: Address) -> Result<Bytes>;
}
