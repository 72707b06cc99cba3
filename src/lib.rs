//! OmniMed: a locally-run clinical document pipeline that sequences vision,
//! retrieval, reasoning and voice models on a single memory-constrained
//! accelerator.
//!
//! The crate's core is the control plane, not the models: a resource
//! arbiter that keeps at most one heavy model device-resident at a time, an
//! orchestrator that drives a request through the stage sequence with a
//! durable human-approval gate, and a batch ingestion / top-k retrieval
//! subsystem over a SQLite-backed vector index.

pub mod cli;
pub mod config;
pub mod db;
pub mod index;
pub mod pipeline;
pub mod resource;
