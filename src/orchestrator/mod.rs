//! Application-level orchestration.
//!
//! This module owns the detection run lifecycle (connect, validate, submit,
//! fold push events, reach a terminal status) and post-run processing such as
//! auto-save and exports. UI/CLI layers call into this module to keep
//! responsibilities separated.

mod connection;
mod controller;
mod coordinator;
mod post_process;
mod submitter;

pub(crate) use controller::{run_controller, RunRequest, UiCommand};
pub use coordinator::Coordinator;
#[cfg(all(test, feature = "tui"))]
pub(crate) use post_process::build_report;
pub(crate) use post_process::OutputTargets;
