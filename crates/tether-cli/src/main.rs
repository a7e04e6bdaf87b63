//! Tether CLI tools: key generation, crypto self-test, handshake simulation.

#![forbid(unsafe_code)]

mod keygen;
mod selftest;
mod simulate;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Tether CLI tools")]
struct Args {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new X25519 static keypair
    Keygen(keygen::KeygenArgs),

    /// Run the built-in crypto checks
    Selftest,

    /// Run two peers through a handshake over a jittery in-process link
    Simulate(simulate::SimulateArgs),

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.verbose {
        tether_common::init_tracing_with_default("debug");
    } else {
        tether_common::init_tracing();
    }

    match args.command {
        Command::Keygen(keygen) => keygen::run(keygen)?,
        Command::Selftest => selftest::run()?,
        Command::Simulate(sim) => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(simulate::run(sim))?;
        }
        Command::Version => {
            println!("tether {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
