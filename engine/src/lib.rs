//! Resumable, checkpoint-driven orchestration for tiered agent benchmarks.
//!
//! An experiment runs a fixed task across capability tiers (`T0`..`T6`); each
//! tier has subtests, each subtest several runs. Every state change is written
//! to a single checkpoint so an interrupted experiment resumes exactly where it
//! stopped. The crate keeps a strict separation:
//!
//! - **[`core`]**: pure logic (state machines, checkpoint mutation, resets,
//!   selection, baseline merging). No I/O.
//! - **[`io`]**: filesystem, child processes and the external collaborators
//!   (agent, judge, resource fixtures).
//!
//! Orchestration modules ([`runner`], [`resume`], [`parallel`], [`subtest`],
//! [`coordinator`]) combine the two.

pub mod coordinator;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod parallel;
pub mod resume;
pub mod runner;
pub mod subtest;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
