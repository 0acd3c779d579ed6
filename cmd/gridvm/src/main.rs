//! gridvm host process
//!
//! Boots a VM from command-line options and runs until a termination
//! signal arrives. Log filtering follows `RUST_LOG` (default `info`).

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gridvm_fabric::{shutdown_requested, Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "gridvm", about = "Distributed computation runtime host", version)]
struct Cli {
    /// Cluster this process belongs to
    #[arg(long, short = 'c', default_value_t = 0)]
    cluster: i32,

    /// Worker threads in the task pool
    #[arg(long = "num-threads", short = 't', default_value_t = 1)]
    num_threads: usize,

    /// OS threads pumping the reactor pool
    #[arg(long = "num-network-threads", short = 'n', default_value_t = 1)]
    num_network_threads: usize,

    /// Single-threaded reactors for network sessions
    #[arg(long = "num-reactors", short = 'r', default_value_t = 1)]
    num_reactors: usize,

    /// IPv4 address to listen on
    #[arg(long, short = 'a', default_value = "127.0.0.1")]
    address: String,

    /// TCP port to listen on
    #[arg(long, short = 'p', default_value_t = 55699)]
    port: u16,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = VmConfig {
        cluster: cli.cluster,
        num_threads: cli.num_threads,
        num_network_threads: cli.num_network_threads,
        num_reactors: cli.num_reactors,
        host: cli.address,
        port: cli.port,
        ..VmConfig::default()
    };

    let vm = match Vm::new(config) {
        Ok(vm) => vm,
        Err(e) => {
            tracing::error!(error = %e, "vm initialisation failed");
            return ExitCode::FAILURE;
        }
    };

    while !shutdown_requested() && !vm.stopping() {
        std::thread::sleep(Duration::from_millis(200));
    }

    vm.wait_for_done();
    tracing::info!("vm stopped");
    ExitCode::SUCCESS
}
