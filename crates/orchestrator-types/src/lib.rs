//! Shared data types for the concurrent task orchestration core.
//!
//! This crate defines the plain, runtime-agnostic shapes that cross the
//! boundary between callers and `orchestrator-core`: result structs, option
//! structs, progress snapshots, and the closed-set `thiserror` error enums
//! each component raises. It depends on nothing beyond `serde` and
//! `thiserror` -- never on `tokio`, `dashmap`, or `anyhow` -- so it can be
//! shared with a future host without dragging in the runtime.

pub mod batch;
pub mod throttle;
pub mod tool;
pub mod workflow;
