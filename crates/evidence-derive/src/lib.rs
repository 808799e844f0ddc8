//! evidence-derive: turns raw transaction records into forensic facts.
//!
//! Stateless decoders produce per-transaction facts, accumulators fold them
//! into run-wide profiles, and the linkage registry ties token spends to the
//! approvals that allowed them. [`Pipeline`] drives all three over a
//! [`evidence_data::ChainSource`] and writes to a [`evidence_data::RecordSink`].

pub mod decoder;
pub mod facts;
pub mod linkage;
pub mod pipeline;
pub mod profile;

pub use facts::{Fact, STREAMS};
pub use pipeline::{Pipeline, PipelineConfig, RunPhase, RunProgress, RunSummary};
