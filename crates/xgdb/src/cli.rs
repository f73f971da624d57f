//! CLI definitions.

use clap::Parser;
use xgdb::{DetachPolicy, StubConfig};

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "xgdb")]
#[command(about = "GDB remote stub serving a simulated PowerPC guest")]
#[command(version)]
pub struct Cli {
    /// TCP port to listen on (127.0.0.1 only)
    #[arg(short, long, default_value = "9000")]
    pub port: u16,

    /// Exit after the first debugger disconnects
    #[arg(long)]
    pub oneshot: bool,

    /// Leave breakpoints installed when the debugger detaches
    #[arg(long)]
    pub keep_breakpoints: bool,

    /// Number of guest threads in the demo engine
    #[arg(long, default_value = "2", value_parser = clap::value_parser!(u32).range(1..=64))]
    pub threads: u32,

    /// Start the guest running instead of paused
    #[arg(long)]
    pub start_running: bool,

    /// Milliseconds between guest instruction ticks
    #[arg(long, default_value = "1")]
    pub tick_ms: u64,

    /// Show protocol metrics summary on exit
    #[arg(long)]
    pub metrics: bool,

    /// Enable verbose output (sets RUST_LOG=debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub silent: bool,
}

impl Cli {
    #[must_use]
    pub fn stub_config(&self) -> StubConfig {
        StubConfig {
            port: self.port,
            reconnect: !self.oneshot,
            detach_policy: if self.keep_breakpoints {
                DetachPolicy::KeepBreakpoints
            } else {
                DetachPolicy::ClearBreakpoints
            },
        }
    }

    /// Default `tracing` directives for the chosen verbosity.
    #[must_use]
    pub const fn log_directives(&self) -> [&'static str; 2] {
        if self.verbose {
            ["xgdb=debug", "xgdb_engine=debug"]
        } else if self.silent {
            ["xgdb=error", "xgdb_engine=error"]
        } else {
            ["xgdb=info", "xgdb_engine=info"]
        }
    }
}
