//! Run-wide activity aggregates.
//!
//! Profiles and method statistics are created lazily on first reference,
//! mutated as facts stream through, and emitted exactly once when the run
//! finalizes. All state lives in ordered maps so output is deterministic.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::{Address, Selector, U256};
use evidence_data::types::TransactionRecord;
use serde::Serialize;

use crate::decoder::method_name;
use crate::facts::{ser, Asset, AssetTransferFact, BlockMoment};

/// Activity aggregate for one address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AddressProfileRecord {
    #[serde(serialize_with = "ser::address")]
    pub address: Address,
    pub tx_out_count: u64,
    pub tx_in_count: u64,
    #[serde(serialize_with = "ser::decimal")]
    pub eth_in_wei: U256,
    #[serde(serialize_with = "ser::decimal")]
    pub eth_out_wei: U256,
    /// Token contract -> cumulative amount received.
    #[serde(serialize_with = "ser::decimal_map")]
    pub erc20_in: BTreeMap<Address, U256>,
    /// Token contract -> cumulative amount sent.
    #[serde(serialize_with = "ser::decimal_map")]
    pub erc20_out: BTreeMap<Address, U256>,
    pub gas_used: u64,
    #[serde(serialize_with = "ser::decimal")]
    pub gas_spent_wei: U256,
    pub first_seen: BlockMoment,
    pub last_seen: BlockMoment,
    #[serde(serialize_with = "ser::address_set")]
    pub call_targets: BTreeSet<Address>,
    /// Set only when end-of-run enrichment ran and the lookup succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_contract: Option<bool>,
    #[serde(
        serialize_with = "ser::opt_decimal",
        skip_serializing_if = "Option::is_none"
    )]
    pub balance_end_wei: Option<U256>,
}

impl AddressProfileRecord {
    fn new(address: Address, at: BlockMoment) -> Self {
        Self {
            address,
            tx_out_count: 0,
            tx_in_count: 0,
            eth_in_wei: U256::ZERO,
            eth_out_wei: U256::ZERO,
            erc20_in: BTreeMap::new(),
            erc20_out: BTreeMap::new(),
            gas_used: 0,
            gas_spent_wei: U256::ZERO,
            first_seen: at,
            last_seen: at,
            call_targets: BTreeSet::new(),
            is_contract: None,
            balance_end_wei: None,
        }
    }

    fn seen(&mut self, at: BlockMoment) {
        self.first_seen = self.first_seen.min(at);
        self.last_seen = self.last_seen.max(at);
    }
}

/// Call statistics for one `(contract, selector)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MethodStatRecord {
    #[serde(serialize_with = "ser::address")]
    pub contract: Address,
    pub selector: Selector,
    pub method: Option<&'static str>,
    pub call_count: u64,
    pub success_count: u64,
    pub revert_count: u64,
    #[serde(serialize_with = "ser::address_set")]
    pub callers: BTreeSet<Address>,
    pub first_seen: BlockMoment,
    pub last_seen: BlockMoment,
}

/// Finalized aggregates, in key order.
#[derive(Debug, Default)]
pub struct Aggregates {
    pub profiles: Vec<AddressProfileRecord>,
    pub methods: Vec<MethodStatRecord>,
}

#[derive(Debug, Default)]
pub struct ProfileAccumulator {
    profiles: BTreeMap<Address, AddressProfileRecord>,
    methods: BTreeMap<(Address, Selector), MethodStatRecord>,
}

impl ProfileAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn profile(&mut self, address: Address, at: BlockMoment) -> &mut AddressProfileRecord {
        let profile = self
            .profiles
            .entry(address)
            .or_insert_with(|| AddressProfileRecord::new(address, at));
        profile.seen(at);
        profile
    }

    /// Counts a top-level transaction for its sender and recipient.
    ///
    /// The sender is charged the fee and records the recipient as a call
    /// target. Contract creations have no recipient side.
    pub fn touch_transaction(&mut self, tx: &TransactionRecord) {
        let at = BlockMoment::of(tx);

        let sender = self.profile(tx.from, at);
        sender.tx_out_count += 1;
        sender.gas_used = sender.gas_used.saturating_add(tx.gas_used);
        sender.gas_spent_wei = sender.gas_spent_wei.saturating_add(tx.fee_wei());
        if let Some(to) = tx.to {
            sender.call_targets.insert(to);
        }

        if let Some(to) = tx.to {
            self.profile(to, at).tx_in_count += 1;
        }
    }

    /// Applies one asset movement to both sides.
    pub fn touch_transfer(&mut self, fact: &AssetTransferFact) {
        match fact.asset {
            Asset::Native => {
                let sender = self.profile(fact.from, fact.at);
                sender.eth_out_wei = sender.eth_out_wei.saturating_add(fact.amount);
                sender.call_targets.insert(fact.to);

                let recipient = self.profile(fact.to, fact.at);
                recipient.eth_in_wei = recipient.eth_in_wei.saturating_add(fact.amount);
            }
            Asset::Token(token) => {
                let sender = self.profile(fact.from, fact.at);
                let out = sender.erc20_out.entry(token).or_insert(U256::ZERO);
                *out = out.saturating_add(fact.amount);

                let recipient = self.profile(fact.to, fact.at);
                let received = recipient.erc20_in.entry(token).or_insert(U256::ZERO);
                *received = received.saturating_add(fact.amount);
            }
        }
    }

    /// Counts one top-level call of `selector` on contract `to`.
    ///
    /// # Arguments
    /// * `to` - Called contract
    /// * `selector` - First four bytes of the calldata
    /// * `caller` - Transaction sender
    /// * `success` - Receipt status; a revert still counts as a call
    /// * `at` - Block of the transaction
    pub fn touch_method_call(
        &mut self,
        to: Address,
        selector: Selector,
        caller: Address,
        success: bool,
        at: BlockMoment,
    ) {
        let stat = self
            .methods
            .entry((to, selector))
            .or_insert_with(|| MethodStatRecord {
                contract: to,
                selector,
                method: method_name(selector),
                call_count: 0,
                success_count: 0,
                revert_count: 0,
                callers: BTreeSet::new(),
                first_seen: at,
                last_seen: at,
            });
        stat.call_count += 1;
        if success {
            stat.success_count += 1;
        } else {
            stat.revert_count += 1;
        }
        stat.callers.insert(caller);
        stat.first_seen = stat.first_seen.min(at);
        stat.last_seen = stat.last_seen.max(at);
    }

    /// Number of distinct addresses seen so far.
    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    /// Consumes the accumulator and yields one record per distinct key.
    pub fn finalize(self) -> Aggregates {
        Aggregates {
            profiles: self.profiles.into_values().collect(),
            methods: self.methods.into_values().collect(),
        }
    }
}
