//! Bug agent library crate
//!
//! Watches a web application's repository, runs browser tests against it,
//! files LLM-analysed bug reports on GitHub and proposes reviewed fixes once a
//! maintainer confirms a report. The binary in `main.rs` is a thin CLI over
//! [`orchestrator::Orchestrator`].

pub mod analyzer;
pub mod config;
pub mod fixer;
pub mod git_ops;
pub mod github;
pub mod llm;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod reporter;
pub mod reviewer;
pub mod scanner;
pub mod state;
pub mod testing;
pub mod util;

#[cfg(test)]
mod testsupport;
