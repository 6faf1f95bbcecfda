//! CLI command implementations.

pub mod check;
pub mod cidr;
pub mod run;
