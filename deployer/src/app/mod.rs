//! Command-line front end

pub mod options;
pub mod run;
pub mod state;
