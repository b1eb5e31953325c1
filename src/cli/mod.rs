//! Command-line interface for running exported vision models

mod config;
#[path = "main.rs"]
mod main_impl;

pub use main_impl::{main, Cli, CliRsegOutput};
