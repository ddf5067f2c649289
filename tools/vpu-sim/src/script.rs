//! Scenario scripts - Ordered broker calls, interrupts and checks
//!
//! Steps run in file order on the main thread. A call marked `background`
//! runs on its own thread so later steps can release what it waits for;
//! `join` collects its result.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use colored::Colorize;
use serde::Deserialize;
use vpu_broker::{BrokerError, Client, CoreId, Request, Response};

use crate::platform::Simulation;

#[derive(Debug, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "do", rename_all = "snake_case")]
pub enum Step {
    Call {
        client: String,
        request: Request,
        #[serde(default)]
        background: Option<String>,
        #[serde(default)]
        expect: Option<String>,
    },
    Join {
        name: String,
        #[serde(default)]
        expect: Option<String>,
    },
    /// Set status bits in a bank, then fire the line if one is given
    Raise {
        base: u64,
        offset: usize,
        bits: u32,
        #[serde(default)]
        line: Option<u32>,
    },
    Interrupt {
        client: String,
    },
    Close {
        client: String,
    },
    Sleep {
        ms: u64,
    },
    Status,
    Power,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Outcome of a script run
#[derive(Debug, Default)]
pub struct Summary {
    pub steps: usize,
    pub failures: usize,
}

fn errno_name(err: &BrokerError) -> &'static str {
    match -err.as_errno() {
        4 => "eintr",
        14 => "efault",
        16 => "ebusy",
        19 => "enodev",
        22 => "einval",
        95 => "eopnotsupp",
        _ => "unknown",
    }
}

fn describe(response: &Response) -> String {
    let core = |raw: u32| {
        CoreId::from_raw(raw).map_or_else(|_| format!("{raw:#010x}"), |id| id.to_string())
    };
    match response {
        Response::Done => "done".into(),
        Response::Core(raw) => core(*raw),
        Response::NoCore => "no core".into(),
        Response::Count(n) => format!("{n} core(s)"),
        Response::Offset { base, size } => format!("{base:#x} size {size:#x}"),
        Response::IrqStatus(status) => format!("status {status:#x}"),
        Response::Registers(regs) => {
            let words: Vec<_> = regs.iter().map(|r| format!("{r:#x}")).collect();
            format!("[{}]", words.join(", "))
        }
        Response::Register(value) => format!("{value:#x}"),
        Response::Completion { core: raw, status } => {
            format!("{} status {:#x}", core(*raw), status)
        }
        Response::Cores(bits) => format!("cores {bits:#b}"),
        Response::AsicId(id) => format!("ID {id:#010x}"),
        Response::Interrupts { delivered, zombies } => {
            format!("{delivered} delivered, {zombies} zombie(s)")
        }
        Response::Status(status) => format!("\n{status}"),
    }
}

/// Print a result and check it against `expect` ("ok" or an errno name)
fn report(label: &str, result: &vpu_broker::Result<Response>, expect: Option<&str>) -> bool {
    let got = match result {
        Ok(_) => "ok",
        Err(e) => errno_name(e),
    };
    let text = match result {
        Ok(response) => describe(response).green().to_string(),
        Err(e) => format!("{} ({})", e, got).red().to_string(),
    };

    match expect {
        Some(want) if !want.eq_ignore_ascii_case(got) => {
            println!("  {} {} -> {} (expected {})", "✗".red(), label, text, want.bold());
            false
        }
        _ => {
            println!("  {} {} -> {}", "✓".green(), label, text);
            true
        }
    }
}

pub fn run(sim: &Simulation, script: &Script) -> Result<Summary> {
    let ctx = &sim.ctx;
    let mut clients: HashMap<String, Arc<Client>> = HashMap::new();
    let mut client = |name: &str| {
        Arc::clone(
            clients
                .entry(name.to_string())
                .or_insert_with(|| ctx.open()),
        )
    };
    let mut summary = Summary::default();

    crossbeam::thread::scope(|s| -> Result<()> {
        let mut pending = HashMap::new();

        let mut steps = || -> Result<()> {
            for step in &script.steps {
                summary.steps += 1;
                let ok = match step {
                    Step::Call {
                        client: name,
                        request,
                        background,
                        expect,
                    } => {
                        let handle = client(name);
                        let label = format!("{name}: {request:?}");
                        match background {
                            Some(tag) => {
                                let request = request.clone();
                                let caller = Arc::clone(&handle);
                                let worker = s.spawn(move |_| ctx.dispatch(&caller, request));
                                println!("  {} {} (in background as '{}')", "…".yellow(), label, tag);
                                pending.insert(tag.clone(), (label, expect.clone(), handle, worker));
                                true
                            }
                            None => {
                                let result = ctx.dispatch(&handle, request.clone());
                                report(&label, &result, expect.as_deref())
                            }
                        }
                    }
                    Step::Join { name, expect } => {
                        let (label, call_expect, _, worker) = pending
                            .remove(name)
                            .ok_or_else(|| anyhow!("No background call named '{name}'"))?;
                        let result = worker
                            .join()
                            .map_err(|_| anyhow!("Background call '{name}' panicked"))?;
                        report(&label, &result, expect.as_deref().or(call_expect.as_deref()))
                    }
                    Step::Raise {
                        base,
                        offset,
                        bits,
                        line,
                    } => {
                        let bank = sim
                            .bus
                            .bank(*base)
                            .ok_or_else(|| anyhow!("No bank at {base:#x}"))?;
                        bank.raise(*offset, *bits);
                        if let Some(line) = line {
                            let outcome = ctx.dispatch_irq(*line);
                            println!(
                                "  {} IRQ {}: {} delivered, {} zombie(s)",
                                "⚡".yellow(),
                                line,
                                outcome.delivered,
                                outcome.zombies
                            );
                        }
                        true
                    }
                    Step::Interrupt { client: name } => {
                        ctx.interrupt(&client(name));
                        println!("  {} {} interrupted", "!".yellow(), name);
                        true
                    }
                    Step::Close { client: name } => {
                        let freed = ctx.close(&client(name));
                        println!("  {} {} closed, {} reservation(s) freed", "×".yellow(), name, freed);
                        true
                    }
                    Step::Sleep { ms } => {
                        std::thread::sleep(Duration::from_millis(*ms));
                        true
                    }
                    Step::Status => {
                        for device in ctx.devices() {
                            print!("{}", device.status());
                        }
                        true
                    }
                    Step::Power => {
                        for event in sim.power.drain() {
                            println!("  {event:?}");
                        }
                        true
                    }
                };
                if !ok {
                    summary.failures += 1;
                }
            }
            Ok(())
        };
        let result = steps();

        // The scope joins every worker on exit: cancel whatever is still blocked.
        for (_, _, handle, _) in pending.values() {
            ctx.interrupt(handle);
        }
        result?;
        if !pending.is_empty() {
            let mut names: Vec<_> = pending.keys().cloned().collect();
            names.sort();
            bail!("Background call(s) never joined: {}", names.join(", "));
        }
        Ok(())
    })
    .map_err(|_| anyhow!("Script worker panicked"))??;

    Ok(summary)
}
