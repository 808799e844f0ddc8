//! Matches token spends to the approvals that authorized them.
//!
//! There is no foreign key between an Approval log and the `transferFrom`
//! that later spends it; the link is made on the `(token, owner, spender)`
//! triple. The registry keeps only the latest approval per triple.

use std::collections::HashMap;

use alloy::primitives::Address;
use evidence_data::types::TransactionRecord;

use crate::decoder::TRANSFER_FROM_SELECTOR;
use crate::facts::{AllowanceUsageFact, ApprovalFact, AssetTransferFact, BlockMoment};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct AllowanceKey {
    token: Address,
    owner: Address,
    spender: Address,
}

/// Most recent approval per `(token, owner, spender)`, in processing order.
#[derive(Debug, Default)]
pub struct ApprovalRegistry {
    latest: HashMap<AllowanceKey, ApprovalFact>,
}

impl ApprovalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `approval`, replacing any earlier approval for the same triple.
    pub fn record(&mut self, approval: &ApprovalFact) {
        let key = AllowanceKey {
            token: approval.token,
            owner: approval.owner,
            spender: approval.spender,
        };
        if let Some(previous) = self.latest.insert(key, approval.clone()) {
            tracing::debug!(
                token = %approval.token,
                owner = %approval.owner,
                spender = %approval.spender,
                replaced_tx = %previous.tx_hash,
                "approval superseded"
            );
        }
    }

    /// Number of distinct `(token, owner, spender)` triples with an approval.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Usage facts for the token transfers of a `transferFrom` transaction.
    ///
    /// Transactions with any other selector yield nothing. Each transfer is
    /// matched against the approval keyed by `(token, transfer.from, tx.from)`
    /// and produces at most one usage.
    pub fn resolve(
        &self,
        tx: &TransactionRecord,
        transfers: &[AssetTransferFact],
    ) -> Vec<AllowanceUsageFact> {
        if tx.selector() != Some(TRANSFER_FROM_SELECTOR) {
            return Vec::new();
        }

        transfers
            .iter()
            .filter_map(|transfer| {
                let key = AllowanceKey {
                    token: transfer.asset.token()?,
                    owner: transfer.from,
                    spender: tx.from,
                };
                let approval = self.latest.get(&key)?;
                Some(AllowanceUsageFact {
                    token: key.token,
                    owner: key.owner,
                    spender: key.spender,
                    approved_amount: approval.amount,
                    used_amount: transfer.amount,
                    approval_tx_hash: approval.tx_hash,
                    usage_tx_hash: tx.hash,
                    at: BlockMoment::of(tx),
                })
            })
            .collect()
    }
}
