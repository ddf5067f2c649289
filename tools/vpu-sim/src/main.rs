//! vpu-sim - Host driver for the VPU broker
//!
//! # Purpose
//! Attaches the devices of a platform description to simulated register
//! banks and drives the broker the way the ioctl layer would:
//! - Probing and status dumps
//! - Scripted multi-client scenarios with interrupts and cancellation
//!
//! # Commands
//! - `status` - Attach the platform and print every core
//! - `run` - Execute a scenario script

mod platform;
mod script;

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::platform::Platform;
use crate::script::Script;

#[derive(Parser)]
#[command(name = "vpu-sim")]
#[command(author)]
#[command(version)]
#[command(about = "Drive the VPU broker against simulated hardware", long_about = None)]
struct Cli {
    /// Platform description (TOML)
    #[arg(short, long, default_value = "configs/keembay.toml")]
    platform: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the platform and print every core
    Status {
        /// Also print the power line transitions made at attach
        #[arg(long)]
        power: bool,
    },

    /// Run a scenario script
    Run {
        /// Script file (TOML)
        script: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let platform = Platform::load(&cli.platform)?;
    let sim = platform.attach()?;

    match cli.command {
        Commands::Status { power } => {
            println!("{}", "VPU broker status".bold().green());
            for device in sim.ctx.devices() {
                print!("{}", device.status());
            }
            if power {
                println!("\n{}", "Power transitions".bold());
                for event in sim.power.drain() {
                    println!("  {event:?}");
                }
            }
        }

        Commands::Run { script } => {
            let script = Script::load(&script)?;
            if !script.description.is_empty() {
                println!("{} {}", "▶".green(), script.description.bold());
            }

            let summary = script::run(&sim, &script)?;
            if summary.failures > 0 {
                bail!(
                    "{} of {} step(s) did not match their expectation",
                    summary.failures,
                    summary.steps
                );
            }
            println!("{} {} step(s) passed", "✅".green(), summary.steps);
        }
    }

    for id in &sim.devices {
        sim.ctx.detach(*id)?;
    }
    Ok(())
}
