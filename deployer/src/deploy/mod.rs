//! Step execution: backends and the executor that dispatches to them

pub mod api;
pub mod backend;
pub mod executor;
pub mod local;
pub mod ssh;
pub mod verify;

pub use backend::{Backend, BackendOutput, BackendRegistry};
pub use executor::StepExecutor;
