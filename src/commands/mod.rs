//! Operator subcommands of `sftd`.

pub mod check;
pub mod daemon;
pub mod jobs;
pub mod load;
