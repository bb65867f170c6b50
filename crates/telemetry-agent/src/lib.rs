//! Telemetry agent: loads a stats declaration and runs collection cycles
//! against recorded endpoint responses.

pub mod config;
pub mod error;
pub mod fixtures;
pub mod runner;

pub use config::{load_context, resolve_declaration_path, resolve_fixtures_dir};
pub use error::{AgentError, AgentResult};
pub use fixtures::FixtureLoader;
pub use runner::{Agent, CycleReport};
