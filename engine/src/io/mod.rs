//! I/O for the orchestration engine: checkpoint storage, artifacts, config and
//! the external collaborators (agent, judge, resource fixtures).

pub mod agent;
pub mod artifacts;
pub mod baseline;
pub mod checkpoint_store;
pub mod config;
pub mod judge;
pub mod process;
pub mod resources;
