//! Data model shared by the planner, executor and engine

pub mod host;
pub mod request;
pub mod step;
