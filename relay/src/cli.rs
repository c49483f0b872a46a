//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default query for `planrelay check`
pub const DEFAULT_CHECK_QUERY: &str = "I want to ride 20 miles";

/// Default endpoint for `planrelay check`
pub const DEFAULT_CHECK_URL: &str = "http://localhost:8000/api/plan";

/// planrelay - two-stage streaming plan relay
#[derive(Parser)]
#[command(
    name = "planrelay",
    about = "Relay a planner and an executor model as one token stream",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server
    Serve {
        /// Interface to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Run as production: the env file is not loaded
        #[arg(long)]
        production: bool,
    },

    /// Run one query through the pipeline in-process and print its frames
    Plan {
        /// The rider's request
        query: String,
    },

    /// Post a query to a running server and print the frames it streams back
    Check {
        /// Planning endpoint
        #[arg(short, long, default_value = DEFAULT_CHECK_URL)]
        url: String,

        /// Query to send
        #[arg(default_value = DEFAULT_CHECK_QUERY)]
        query: String,
    },
}
