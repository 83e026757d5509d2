pub mod action;
pub mod config;
pub mod grader;
pub mod report;
pub mod resolve;
pub mod serdable;
pub mod stage;
pub mod style;
pub mod submission;
pub mod testing;

#[cfg(test)]
mod memhost;

pub use crate::config::Config;
