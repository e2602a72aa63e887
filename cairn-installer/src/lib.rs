//! The `cairn` command line tool.

pub mod cli;
pub mod commands;

use cairn_hal::LinuxHal;
use clap::Parser;
use std::sync::Arc;

/// Parse the command line, set up logging and run the selected action.
pub fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    cairn_core::logging::init(cli.debug, cli.log_file.as_deref());
    commands::dispatch(cli, Arc::new(LinuxHal::new()))
}
