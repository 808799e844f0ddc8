//! Benchmarks for the stateless decoders and profile accumulation.
//!
//! Inputs are synthetic; no RPC is involved.
//! Run with: `cargo bench --package evidence-derive`

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{SolError, SolValue};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use evidence_data::types::{CallKind, CallTraceNode, LogRecord, TransactionRecord, TxStatus};
use evidence_derive::decoder::{
    decode_internal_value_transfers, decode_revert_reason, decode_token_transfer, TRANSFER_TOPIC,
};
use evidence_derive::profile::ProfileAccumulator;

fn sample_tx() -> TransactionRecord {
    TransactionRecord {
        hash: B256::with_last_byte(1),
        from: Address::with_last_byte(1),
        to: Some(Address::with_last_byte(2)),
        value: U256::from(1_000_000_000_000_000u64),
        input: Bytes::new(),
        gas_used: 120_000,
        gas_price: U256::from(30_000_000_000u64),
        status: TxStatus::Success,
        block_number: 19_000_000,
        block_timestamp: 1_705_000_000,
        tx_index: 42,
        contract_address: None,
        revert_reason: None,
    }
}

fn transfer_log(i: u64) -> LogRecord {
    LogRecord {
        address: Address::with_last_byte((i % 8) as u8),
        topics: vec![
            TRANSFER_TOPIC,
            Address::with_last_byte((i % 50) as u8).into_word(),
            Address::with_last_byte((i % 31) as u8).into_word(),
        ],
        data: U256::from(i * 1_000).abi_encode().into(),
        log_index: i,
    }
}

/// Binary call tree of the given depth where every frame carries value.
fn call_tree(depth: u32) -> CallTraceNode {
    let calls = if depth == 0 {
        Vec::new()
    } else {
        vec![call_tree(depth - 1), call_tree(depth - 1)]
    };
    CallTraceNode {
        kind: CallKind::Call,
        from: Address::with_last_byte(depth as u8),
        to: Some(Address::with_last_byte(depth as u8 + 1)),
        value: Some(U256::from(depth + 1)),
        input: Bytes::new(),
        output: None,
        error: None,
        revert_reason: None,
        calls,
    }
}

/// Benchmark: decode 1,000 Transfer logs.
fn bench_decode_transfer_logs(c: &mut Criterion) {
    let tx = sample_tx();
    let logs: Vec<_> = (0..1_000).map(transfer_log).collect();
    c.bench_function("decode_1k_transfer_logs", |b| {
        b.iter(|| {
            logs.iter()
                .filter_map(|log| decode_token_transfer(black_box(&tx), black_box(log)))
                .count()
        });
    });
}

/// Benchmark: walk a 1,023-frame call tree for internal value transfers.
fn bench_internal_transfers(c: &mut Criterion) {
    let tx = sample_tx();
    let root = call_tree(9);
    c.bench_function("internal_transfers_1k_frames", |b| {
        b.iter(|| decode_internal_value_transfers(black_box(&tx), black_box(&root)));
    });
}

/// Benchmark: decode an Error(string) revert payload.
fn bench_revert_reason(c: &mut Criterion) {
    let payload = alloy::sol_types::Revert {
        reason: "UniswapV2: INSUFFICIENT_OUTPUT_AMOUNT".to_string(),
    }
    .abi_encode();
    c.bench_function("revert_reason_error_string", |b| {
        b.iter(|| decode_revert_reason(black_box(Some(payload.as_slice())), None, None));
    });
}

/// Benchmark: fold 1,000 token transfers into address profiles.
fn bench_profile_accumulation(c: &mut Criterion) {
    let tx = sample_tx();
    let transfers: Vec<_> = (0..1_000)
        .filter_map(|i| decode_token_transfer(&tx, &transfer_log(i)))
        .collect();
    c.bench_function("profile_accumulate_1k_transfers", |b| {
        b.iter_batched(
            ProfileAccumulator::new,
            |mut acc| {
                for transfer in &transfers {
                    acc.touch_transfer(black_box(transfer));
                }
                acc.finalize()
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_decode_transfer_logs,
    bench_internal_transfers,
    bench_revert_reason,
    bench_profile_accumulation
);
criterion_main!(benches);
