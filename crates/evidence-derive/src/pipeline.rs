//! Run orchestration: fetch, decode, accumulate, write.
//!
//! A run walks an externally supplied list of transaction hashes in order.
//! Per-transaction facts are written to the sink as soon as they are derived;
//! aggregates are written once at the end. A transaction that cannot be
//! fetched is recorded in the `fetch_failure` stream and skipped. Missing
//! traces or prestates only narrow what is derived for that transaction.

use std::collections::BTreeMap;

use alloy::primitives::B256;
use eyre::{bail, Result, WrapErr};
use evidence_data::sink::{RecordSink, SinkSummary};
use evidence_data::source::{Capture, ChainSource};
use evidence_data::types::{CallTraceNode, FetchedTransaction, PrestateSnapshot};
use serde::Serialize;

use crate::decoder::{
    decode_approval, decode_internal_value_transfers, decode_revert_reason, decode_token_transfer,
    decode_tx_value, method_name, trace_edges,
};
use crate::facts::{
    BlockMoment, CaptureMode, ContractCallFact, Fact, FetchFailure, RevertReasonFact,
    StateDiffFact, TxEnrichedFact, STREAMS,
};
use crate::linkage::ApprovalRegistry;
use crate::profile::{Aggregates, ProfileAccumulator};

/// Lifecycle of a run. Only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Streaming,
    Finalizing,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Stamped on every record; must be non-empty.
    pub run_id: String,
    /// Look up code and end-of-run balance for every profiled address.
    pub enrich_profiles: bool,
}

impl PipelineConfig {
    /// Configuration with profile enrichment switched off.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            enrich_profiles: false,
        }
    }

    /// Turns the end-of-run code and balance lookups on or off.
    pub fn with_enrichment(mut self, enrich_profiles: bool) -> Self {
        self.enrich_profiles = enrich_profiles;
        self
    }

    /// # Errors
    /// Returns error if the run id is blank.
    pub fn validate(&self) -> Result<()> {
        if self.run_id.trim().is_empty() {
            bail!("run id must not be empty");
        }
        Ok(())
    }
}

/// Progress snapshot handed to the progress callback after each transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunProgress {
    pub processed: usize,
    pub total: usize,
    pub failures: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub phase: RunPhase,
    pub requested: usize,
    pub processed: usize,
    pub fetch_failures: usize,
    pub traces_captured: usize,
    pub prestates_captured: usize,
    pub profiles: usize,
    pub sink: SinkSummary,
}

#[derive(Debug, Default)]
struct RunCounters {
    processed: usize,
    fetch_failures: usize,
    traces_captured: usize,
    prestates_captured: usize,
    last_block: Option<u64>,
}

type ProgressFn = Box<dyn FnMut(RunProgress)>;

pub struct Pipeline<S, K> {
    source: S,
    sink: K,
    config: PipelineConfig,
    phase: RunPhase,
    profiles: ProfileAccumulator,
    approvals: ApprovalRegistry,
    counters: RunCounters,
    on_progress: Option<ProgressFn>,
}

impl<S: ChainSource, K: RecordSink> Pipeline<S, K> {
    /// Creates a pipeline in the [`RunPhase::Init`] phase.
    ///
    /// Nothing is fetched or written until [`Pipeline::run`].
    ///
    /// # Arguments
    /// * `source` - Chain data for the transactions to process
    /// * `sink` - Destination for every record the run produces
    /// * `config` - Run id and enrichment switch
    ///
    /// # Example
    /// ```no_run
    /// # use evidence_data::fixture::FixtureSource;
    /// # use evidence_data::sink::MemorySink;
    /// # use evidence_derive::{Pipeline, PipelineConfig};
    /// # async fn example() -> eyre::Result<()> {
    /// let source = FixtureSource::load(std::path::Path::new("recorded.json"))?;
    /// let hashes = source.hashes();
    /// let mut pipeline = Pipeline::new(source, MemorySink::new(), PipelineConfig::new("run-1"));
    /// let summary = pipeline.run(&hashes).await?;
    /// println!("{} transactions processed", summary.processed);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(source: S, sink: K, config: PipelineConfig) -> Self {
        Self {
            source,
            sink,
            config,
            phase: RunPhase::Init,
            profiles: ProfileAccumulator::new(),
            approvals: ApprovalRegistry::new(),
            counters: RunCounters::default(),
            on_progress: None,
        }
    }

    /// Registers a callback invoked after every transaction, fetch failures
    /// included.
    pub fn on_progress(mut self, callback: impl FnMut(RunProgress) + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Hands back the sink, typically after [`Pipeline::run`] to read what
    /// was written.
    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Processes `hashes` in order and finalizes the run.
    ///
    /// # Errors
    /// Returns error on invalid configuration, if the pipeline already ran,
    /// or if the sink fails. Per-transaction fetch errors are recorded and
    /// do not fail the run.
    #[tracing::instrument(skip_all, fields(run_id = %self.config.run_id, transactions = hashes.len()))]
    pub async fn run(&mut self, hashes: &[B256]) -> Result<RunSummary> {
        if self.phase != RunPhase::Init {
            bail!("pipeline already ran (phase {:?})", self.phase);
        }
        self.config.validate()?;

        for spec in STREAMS {
            self.sink
                .open_stream(spec)
                .wrap_err_with(|| format!("failed to open stream {}", spec.name))?;
        }
        self.phase = RunPhase::Streaming;
        tracing::info!(backend = self.sink.backend_type(), "run started");

        for (position, hash) in hashes.iter().enumerate() {
            self.process_transaction(*hash).await?;
            if let Some(callback) = self.on_progress.as_mut() {
                callback(RunProgress {
                    processed: position + 1,
                    total: hashes.len(),
                    failures: self.counters.fetch_failures,
                });
            }
        }

        self.phase = RunPhase::Finalizing;
        let aggregates = std::mem::take(&mut self.profiles).finalize();
        let profiles = aggregates.profiles.len();
        self.write_aggregates(aggregates).await?;
        let sink = self.sink.finish().wrap_err("failed to finish record sink")?;
        self.phase = RunPhase::Done;

        let summary = RunSummary {
            run_id: self.config.run_id.clone(),
            phase: self.phase,
            requested: hashes.len(),
            processed: self.counters.processed,
            fetch_failures: self.counters.fetch_failures,
            traces_captured: self.counters.traces_captured,
            prestates_captured: self.counters.prestates_captured,
            profiles,
            sink,
        };
        tracing::info!(
            processed = summary.processed,
            fetch_failures = summary.fetch_failures,
            profiles = summary.profiles,
            "run finished"
        );
        Ok(summary)
    }

    fn emit(&mut self, fact: Fact) -> Result<()> {
        let line = fact
            .to_json_line(&self.config.run_id)
            .wrap_err("failed to serialize fact")?;
        self.sink.append(fact.stream(), &line)
    }

    #[tracing::instrument(skip_all, fields(tx = %hash))]
    async fn process_transaction(&mut self, hash: B256) -> Result<()> {
        let fetched = match self.source.fetch_transaction(hash).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::warn!(error = %err, "fetch failed, skipping transaction");
                self.counters.fetch_failures += 1;
                return self.emit(Fact::FetchFailure(FetchFailure {
                    tx_hash: hash,
                    error: format!("{err:#}"),
                    failed_at: chrono::Utc::now().to_rfc3339(),
                }));
            }
        };

        let (trace, prestate) =
            futures::join!(self.source.call_trace(hash), self.source.prestate(hash));
        for (what, status) in [("call trace", trace.status()), ("prestate", prestate.status())] {
            if status != "captured" {
                tracing::debug!(status, "{what} not available");
            }
        }
        if let Capture::Failed(reason) = &trace {
            tracing::warn!(%reason, "call tracer failed");
        }

        self.derive(fetched, trace, prestate)
    }

    fn derive(
        &mut self,
        fetched: FetchedTransaction,
        trace: Capture<CallTraceNode>,
        prestate: Capture<Vec<PrestateSnapshot>>,
    ) -> Result<()> {
        let trace_status = trace.status();
        let prestate_status = prestate.status();
        let trace = trace.captured();
        let prestate = prestate.captured();

        let FetchedTransaction { transaction: tx, logs } = fetched;
        let at = BlockMoment::of(&tx);
        let success = tx.status.is_success();

        self.counters.processed += 1;
        self.counters.last_block = self.counters.last_block.max(Some(tx.block_number));
        self.counters.traces_captured += usize::from(trace.is_some());
        self.counters.prestates_captured += usize::from(prestate.is_some());

        let mut token_transfers = Vec::new();
        let mut approvals = Vec::new();
        for log in &logs {
            if let Some(transfer) = decode_token_transfer(&tx, log) {
                token_transfers.push(transfer);
            } else if let Some(approval) = decode_approval(&tx, log) {
                approvals.push(approval);
            }
        }

        // The root frame repeats tx.value, which decode_tx_value already covers.
        let internal: Vec<_> = trace
            .as_ref()
            .filter(|_| success)
            .map(|root| decode_internal_value_transfers(&tx, root))
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t.depth.is_some_and(|depth| depth >= 1))
            .collect();

        // Resolve before recording so a usage can only point at an earlier approval.
        let usages = self.approvals.resolve(&tx, &token_transfers);
        for approval in &approvals {
            self.approvals.record(approval);
        }

        self.profiles.touch_transaction(&tx);
        let top_level = decode_tx_value(&tx);
        for transfer in top_level.iter().chain(&token_transfers).chain(&internal) {
            self.profiles.touch_transfer(transfer);
        }

        let selector = tx.selector();
        let contract_call = match (tx.to, selector) {
            (Some(to), Some(selector)) => {
                self.profiles
                    .touch_method_call(to, selector, tx.from, success, at);
                Some(ContractCallFact {
                    tx_hash: tx.hash,
                    at,
                    from: tx.from,
                    to,
                    selector,
                    method: method_name(selector),
                    value_wei: tx.value,
                    status: tx.status.as_str(),
                    gas_used: tx.gas_used,
                })
            }
            _ => None,
        };

        let revert = (!success)
            .then(|| {
                decode_revert_reason(
                    trace
                        .as_ref()
                        .and_then(|root| root.output.as_ref())
                        .map(|out| &out[..]),
                    trace.as_ref().and_then(|root| root.revert_reason.as_deref()),
                    tx.revert_reason.as_deref(),
                )
            })
            .flatten();

        let enriched = TxEnrichedFact {
            tx_hash: tx.hash,
            at,
            tx_index: tx.tx_index,
            from: tx.from,
            to: tx.to,
            contract_created: tx.contract_address,
            value_wei: tx.value,
            gas_used: tx.gas_used,
            gas_price_wei: tx.gas_price,
            fee_wei: tx.fee_wei(),
            status: tx.status.as_str(),
            selector,
            method: selector.and_then(method_name),
            log_count: logs.len(),
            token_transfer_count: token_transfers.len(),
            approval_count: approvals.len(),
            internal_transfer_count: internal.len(),
            trace_status,
            prestate_status,
            revert_reason: revert.as_ref().map(|r| r.reason.clone()),
        };

        for transfer in top_level.into_iter().chain(token_transfers) {
            let edge = transfer.edge();
            self.emit(Fact::AssetTransfer(transfer))?;
            self.emit(Fact::FundFlowEdge(edge))?;
        }
        for transfer in internal {
            let edge = transfer.edge();
            self.emit(Fact::InternalNativeTransfer(transfer))?;
            self.emit(Fact::FundFlowEdge(edge))?;
        }
        for approval in approvals {
            let edge = approval.edge();
            self.emit(Fact::Approval(approval))?;
            self.emit(Fact::AllowanceEdge(edge))?;
        }
        for usage in usages {
            self.emit(Fact::AllowanceUsage(usage))?;
        }
        if let Some(call) = contract_call {
            self.emit(Fact::ContractCall(call))?;
        }
        if let Some(root) = &trace {
            for edge in trace_edges(&tx, root) {
                self.emit(Fact::TraceEdge(edge))?;
            }
        }
        if let Some(revert) = revert {
            self.emit(Fact::RevertReason(RevertReasonFact {
                tx_hash: tx.hash,
                at,
                from: tx.from,
                to: tx.to,
                selector,
                reason: revert.reason,
                source: revert.source,
            }))?;
        }
        for snapshot in prestate.into_iter().flatten() {
            self.emit(Fact::StateDiff(StateDiffFact {
                tx_hash: tx.hash,
                at,
                mode: CaptureMode::PrestateOnly,
                address: snapshot.address,
                balance_before: snapshot.balance_before,
                balance_after: None,
                nonce_before: snapshot.nonce_before,
                has_code: snapshot.has_code,
                storage_before: snapshot.storage_before,
                storage_after: None,
            }))?;
        }
        self.emit(Fact::TxEnriched(enriched))
    }

    async fn write_aggregates(&mut self, mut aggregates: Aggregates) -> Result<()> {
        if self.config.enrich_profiles {
            self.enrich(&mut aggregates).await;
        }
        for profile in aggregates.profiles {
            self.emit(Fact::AddressProfile(profile))?;
        }
        for stat in aggregates.methods {
            self.emit(Fact::MethodStat(stat))?;
        }
        Ok(())
    }

    /// Best-effort code and balance lookups; failures leave the fields unset.
    async fn enrich(&self, aggregates: &mut Aggregates) {
        let Some(block) = self.counters.last_block else {
            return;
        };
        let mut failures = BTreeMap::new();
        for profile in &mut aggregates.profiles {
            match self.source.code_at(profile.address).await {
                Ok(code) => profile.is_contract = Some(!code.is_empty()),
                Err(err) => {
                    tracing::debug!(address = %profile.address, error = %err, "code lookup failed");
                    *failures.entry("code").or_insert(0u64) += 1;
                }
            }
            match self.source.balance_at(profile.address, block).await {
                Ok(balance) => profile.balance_end_wei = Some(balance),
                Err(err) => {
                    tracing::debug!(address = %profile.address, error = %err, "balance lookup failed");
                    *failures.entry("balance").or_insert(0u64) += 1;
                }
            }
        }
        if !failures.is_empty() {
            tracing::warn!(?failures, block, "profile enrichment incomplete");
        }
    }
}
