//! Claude Fleet - supervise long-lived Claude Code workers.

pub mod cli;
pub mod config;
pub mod display;
pub mod supervisor;
