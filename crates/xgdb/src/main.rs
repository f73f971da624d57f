//! xgdb CLI - GDB stub for a simulated PowerPC guest

mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use xgdb::GdbServer;
use xgdb_engine::{Engine, SimEngine};

use cli::{Cli, EXIT_FAILURE, EXIT_SUCCESS};

/// Base of the demo guest image.
const IMAGE_BASE: u64 = 0x8200_0000;
const IMAGE_SIZE: usize = 0x10_0000;
/// Kernel module placeholder.
const KERNEL_BASE: u64 = 0x8008_0000;
/// `ori r0, r0, 0`
const NOP: [u8; 4] = [0x60, 0x00, 0x00, 0x00];

fn demo_engine(cli: &Cli) -> Arc<SimEngine> {
    let mut builder = SimEngine::builder()
        .region(IMAGE_BASE, IMAGE_SIZE)
        .module("default.xex", IMAGE_BASE, IMAGE_SIZE as u64)
        .module("xboxkrnl.exe", KERNEL_BASE, 0x4_0000)
        .thread("main", IMAGE_BASE)
        .running(cli.start_running);
    for i in 1..cli.threads {
        builder = builder.thread(format!("worker{i}"), IMAGE_BASE + u64::from(i) * 0x1000);
    }
    Arc::new(builder.build())
}

fn run(cli: &Cli) -> xgdb::Result<()> {
    let sim = demo_engine(cli);
    let image = NOP.repeat(IMAGE_SIZE / NOP.len());
    sim.write_memory(IMAGE_BASE, &image)?;
    sim.spawn_runner(Duration::from_millis(cli.tick_ms))?;

    let server = GdbServer::bind(sim, cli.stub_config())?;
    info!(
        addr = %server.local_addr()?,
        threads = cli.threads,
        "debug stub ready (target remote localhost:{})",
        cli.port
    );
    server.serve()
}

fn main() {
    let cli = Cli::parse();

    let metrics_handle = if cli.metrics {
        xgdb::metrics::SummaryRecorder::new().install()
    } else {
        None
    };
    xgdb::metrics::init();

    let mut filter = EnvFilter::from_default_env();
    for directive in cli.log_directives() {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let exit_code = match run(&cli) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            error!("{e}");
            EXIT_FAILURE
        }
    };

    if let Some(handle) = metrics_handle {
        handle.print_summary();
    }

    std::process::exit(exit_code);
}
