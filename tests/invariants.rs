//! Cross-cutting properties of a run: value conservation, approval
//! soundness, graceful degradation and shard boundaries.

mod common;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use alloy::primitives::{B256, U256};
use common::*;
use evidence_data::fixture::FixtureTransaction;
use evidence_data::sink::{EmptyMeaning, JsonlShardSink, RecordSink, StreamSpec};
use evidence_data::types::TxStatus;

fn mixed_workload() -> Vec<FixtureTransaction> {
    let token = addr(0x70);
    let mut txs = Vec::new();
    for n in 1..=24u8 {
        let from = addr(n % 5 + 1);
        let to = addr((n * 3) % 7 + 1);
        let mut tx = sample_tx(n, from, to, u64::from(n) * 10);
        if n % 6 == 0 {
            tx.status = TxStatus::Revert;
        }
        let mut fixture = FixtureTransaction::new(tx);
        if n % 2 == 0 {
            fixture = fixture.with_trace(call_frame(
                from,
                to,
                u64::from(n) * 10,
                vec![
                    call_frame(to, addr(n % 4 + 20), u64::from(n), vec![]),
                    call_frame(to, addr(21), 0, vec![call_frame(addr(21), from, 3, vec![])]),
                ],
            ));
        }
        if n % 3 == 0 {
            fixture = fixture.with_logs(vec![transfer_log(token, from, to, u64::from(n), 0)]);
        }
        txs.push(fixture);
    }
    txs
}

/// eth_in - eth_out per profile equals the net of native transfer facts.
#[tokio::test]
async fn native_value_is_conserved() {
    let (_, sink) = run_fixture(mixed_workload()).await;

    let mut net: BTreeMap<String, (U256, U256)> = BTreeMap::new();
    let native = sink
        .records("asset_transfer")
        .into_iter()
        .filter(|t| t["asset_kind"] == "native")
        .chain(sink.records("internal_native_transfer"));
    for transfer in native {
        let value = amount(&transfer["amount"]);
        let from = transfer["from"].as_str().expect("from").to_string();
        let to = transfer["to"].as_str().expect("to").to_string();
        net.entry(to).or_default().0 += value;
        net.entry(from).or_default().1 += value;
    }
    assert!(!net.is_empty());

    let profiles = sink.records("address_profile");
    for profile in &profiles {
        let address = profile["address"].as_str().expect("address");
        let (fact_in, fact_out) = net.get(address).copied().unwrap_or_default();
        assert_eq!(amount(&profile["eth_in_wei"]), fact_in, "eth in for {address}");
        assert_eq!(amount(&profile["eth_out_wei"]), fact_out, "eth out for {address}");
    }
    for address in net.keys() {
        assert!(
            profiles.iter().any(|p| p["address"] == *address),
            "{address} moved value but has no profile"
        );
    }
}

/// Every usage points at an approval that was processed strictly earlier.
#[tokio::test]
async fn usages_only_reference_earlier_approvals() {
    let token = addr(0x70);
    let (owner, spender, other) = (addr(1), addr(2), addr(3));

    let (_, sink) = run_fixture(vec![
        // spent before any approval exists: no usage
        FixtureTransaction::new(transfer_from_tx(1, spender, token))
            .with_logs(vec![transfer_log(token, owner, other, 5, 0)]),
        FixtureTransaction::new(sample_tx(2, owner, token, 0))
            .with_logs(vec![approval_log(token, owner, spender, 100, 0)]),
        FixtureTransaction::new(transfer_from_tx(3, spender, token))
            .with_logs(vec![transfer_log(token, owner, other, 10, 0)]),
        // re-approval replaces the earlier amount
        FixtureTransaction::new(sample_tx(4, owner, token, 0))
            .with_logs(vec![approval_log(token, owner, spender, 50, 0)]),
        FixtureTransaction::new(transfer_from_tx(5, spender, token))
            .with_logs(vec![transfer_log(token, owner, other, 20, 0)]),
        // approval and spend in the same transaction: the spend cannot use it
        FixtureTransaction::new(transfer_from_tx(6, other, token)).with_logs(vec![
            approval_log(token, owner, other, 70, 0),
            transfer_log(token, owner, spender, 1, 1),
        ]),
    ])
    .await;

    let approvals = sink.records("approval");
    let approval_blocks: BTreeMap<String, u64> = approvals
        .iter()
        .map(|a| {
            (
                a["tx_hash"].as_str().expect("hash").to_string(),
                a["block_number"].as_u64().expect("block"),
            )
        })
        .collect();

    let usages = sink.records("allowance_usage");
    assert_eq!(usages.len(), 2);
    for usage in &usages {
        let approval_tx = usage["approval_tx_hash"].as_str().expect("approval hash");
        let approved_at = approval_blocks
            .get(approval_tx)
            .expect("usage must reference a recorded approval");
        assert!(*approved_at < usage["block_number"].as_u64().expect("block"));

        let approval = approvals
            .iter()
            .find(|a| a["tx_hash"] == approval_tx)
            .expect("approval record");
        for field in ["token", "owner", "spender"] {
            assert_eq!(approval[field], usage[field]);
        }
    }
    assert_eq!(usages[0]["approved_amount"], "100");
    assert_eq!(usages[1]["approved_amount"], "50");
}

/// Missing tracers and unknown hashes narrow the output but never stop the run.
#[tokio::test]
async fn missing_data_degrades_gracefully() {
    let (a, b) = (addr(1), addr(2));
    let mut reverted = sample_tx(3, a, b, 9);
    reverted.status = TxStatus::Revert;

    let source = evidence_data::fixture::FixtureSource::new(vec![
        FixtureTransaction::new(sample_tx(1, a, b, 1)),
        FixtureTransaction::new(sample_tx(2, a, b, 2))
            .with_trace(call_frame(a, b, 2, vec![]))
            .with_prestate(vec![evidence_data::types::PrestateSnapshot {
                address: a,
                balance_before: Some(U256::from(1_000)),
                nonce_before: Some(4),
                has_code: false,
                storage_before: Default::default(),
            }]),
        FixtureTransaction::new(reverted),
    ]);
    let mut hashes = source.hashes();
    hashes.insert(1, B256::repeat_byte(0xee));

    let mut pipeline = evidence_derive::Pipeline::new(
        source,
        evidence_data::sink::MemorySink::new(),
        evidence_derive::PipelineConfig::new("degraded"),
    );
    let summary = pipeline.run(&hashes).await.expect("run completes");
    let sink = pipeline.into_sink();

    assert_eq!(summary.requested, 4);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.fetch_failures, 1);
    assert_eq!(summary.traces_captured, 1);
    assert_eq!(summary.prestates_captured, 1);

    let enriched = sink.records("tx_enriched");
    let statuses: Vec<_> = enriched
        .iter()
        .map(|e| (e["trace_status"].clone(), e["prestate_status"].clone()))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("unsupported".into(), "unsupported".into()),
            ("captured".into(), "captured".into()),
            ("unsupported".into(), "unsupported".into()),
        ]
    );

    let diffs = sink.records("state_diff");
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0]["mode"], "prestate_only");
    assert_eq!(diffs[0]["balance_before"], "1000");
    assert!(diffs[0]["balance_after"].is_null());
    assert!(diffs[0]["storage_after"].is_null());

    // no reason is decodable without a trace or receipt reason
    assert!(sink.records("revert_reason").is_empty());
    assert_eq!(sink.records("fetch_failure").len(), 1);
    assert_eq!(sink.records("address_profile").len(), 2);
}

fn read_shard(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .expect("shard readable")
        .lines()
        .map(str::to_string)
        .collect()
}

/// N writes at capacity K produce ceil(N/K) shards that replay the writes in order.
#[test]
fn shard_count_and_order_hold_for_any_capacity() {
    const SPEC: StreamSpec = StreamSpec {
        name: "asset_transfer",
        description: "transfers",
        when_empty: EmptyMeaning::ExpectedEmpty("nothing moved"),
    };

    for (n, k) in [(0usize, 3usize), (1, 1), (5, 5), (6, 5), (10, 3), (17, 4), (9, 100)] {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let mut sink = JsonlShardSink::new(dir.path(), "shards", k).expect("sink opens");
        sink.open_stream(&SPEC).expect("stream opens");

        let written: Vec<String> = (0..n).map(|i| format!("{{\"seq\":{i}}}")).collect();
        for line in &written {
            sink.append(SPEC.name, line).expect("append");
        }
        let summary = sink.finish().expect("finish");

        let stream = &summary.streams[0];
        assert_eq!(stream.records as usize, n);
        assert_eq!(stream.shards.len(), n.div_ceil(k), "n={n} k={k}");

        let stream_dir = dir.path().join(SPEC.name);
        let mut replayed = Vec::new();
        let mut seen = HashSet::new();
        for shard in &stream.shards {
            assert!(seen.insert(shard.clone()), "duplicate shard {shard}");
            let lines = read_shard(&stream_dir.join(shard));
            assert!(!lines.is_empty() && lines.len() <= k);
            replayed.extend(lines);
        }
        assert_eq!(replayed, written, "n={n} k={k}");
    }
}
