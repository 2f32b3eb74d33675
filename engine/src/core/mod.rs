//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures (checkpoints, summaries, resource specs) and return
//! deterministic outputs suitable for tests.

pub mod checkpoint;
pub mod rate_limit;
pub mod replay;
pub mod report;
pub mod resources;
pub mod resume;
pub mod selection;
pub mod states;
pub mod tier;
pub mod types;
