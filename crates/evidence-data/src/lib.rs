//! evidence-data crate
//!
//! Raw chain records, the chain-source seam the derivation pipeline reads
//! through, and the append-only record sinks it writes to.

pub mod fixture;
pub mod rpc;
pub mod sink;
pub mod source;
pub mod store;
pub mod types;

pub use sink::{EmptyMeaning, JsonlShardSink, MemorySink, RecordSink, SinkSummary, StreamSpec};
pub use source::{Capture, ChainSource};
pub use types::{
    CallKind, CallTraceNode, FetchedTransaction, LogRecord, PrestateSnapshot, TransactionRecord,
    TxStatus,
};
