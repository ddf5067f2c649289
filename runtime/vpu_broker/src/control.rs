//! Control surface - Typed requests as issued by the ioctl layer
//!
//! Cores are named by their packed 32-bit handle ([`CoreId::to_raw`]),
//! encoder sets by their bitmap. Copying arguments in and out of user
//! memory stays with the caller.

use std::time::Duration;

use serde::Deserialize;

use crate::arbiter::{CoreSet, EncoderRequest};
use crate::client::Client;
use crate::context::Context;
use crate::device::{CacheBinding, DeviceStatus};
use crate::format::CodecFormat;
use crate::registry::{CoreId, CoreKind, DeviceId};
use crate::Result;

/// One broker operation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Reserve {
        device: DeviceId,
        kind: CoreKind,
        format: CodecFormat,
    },
    Release {
        core: u32,
    },
    WaitReady {
        core: u32,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    CoreCount {
        device: DeviceId,
        kind: CoreKind,
    },
    CoreOffset {
        core: u32,
    },
    /// Load a job; the status register goes out last
    PushRegs {
        core: u32,
        regs: Vec<u32>,
    },
    PullRegs {
        core: u32,
        count: usize,
    },
    WriteReg {
        core: u32,
        reg: usize,
        value: u32,
    },
    ReadReg {
        core: u32,
        reg: usize,
    },
    /// Wait for the completion, then pull `count` registers
    WaitAndPull {
        core: u32,
        count: usize,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Packed as bitmap in bits 7:0 and count - 1 in bits 30:28
    ReserveEncoders {
        device: DeviceId,
        core_info: u32,
    },
    ReleaseEncoders {
        device: DeviceId,
        cores: u32,
    },
    WaitEncoders {
        device: DeviceId,
        cores: u32,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    ReservePostProcessor {
        device: DeviceId,
    },
    ReleasePostProcessor {
        device: DeviceId,
    },
    ReserveCache {
        device: DeviceId,
        binding: CacheBinding,
    },
    CoreForFormat {
        device: DeviceId,
        kind: CoreKind,
        format: CodecFormat,
    },
    AsicId {
        core: u32,
    },
    Abort {
        core: u32,
    },
    MaskIrq {
        core: u32,
    },
    UnmaskIrq {
        core: u32,
    },
    SetClockRate {
        device: DeviceId,
        hz: u64,
    },
    PollInterrupts {
        device: DeviceId,
    },
    Status {
        device: DeviceId,
    },
}

/// Result of a successful [`Request`]
#[derive(Debug, Clone)]
pub enum Response {
    Done,
    Core(u32),
    NoCore,
    Count(usize),
    Offset { base: u64, size: usize },
    IrqStatus(u32),
    Registers(Vec<u32>),
    Register(u32),
    Completion { core: u32, status: u32 },
    Cores(u32),
    AsicId(u32),
    Interrupts { delivered: usize, zombies: usize },
    Status(DeviceStatus),
}

fn timeout(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

impl Context {
    /// Execute one request on behalf of `client`
    ///
    /// # Errors
    /// Whatever the underlying operation returns; a malformed core handle
    /// is `InvalidRequest`.
    pub fn dispatch(&self, client: &Client, request: Request) -> Result<Response> {
        let response = match request {
            Request::Reserve { device, kind, format } => {
                let core = self.device(device)?.reserve(client, kind, format)?;
                Response::Core(core.to_raw())
            }
            Request::Release { core } => {
                let core = CoreId::from_raw(core)?;
                self.device(core.device)?.release(client.id(), core)?;
                Response::Done
            }
            Request::WaitReady { core, timeout_ms } => {
                let core = CoreId::from_raw(core)?;
                let status = self
                    .device(core.device)?
                    .wait_ready(client, core, timeout(timeout_ms))?;
                Response::IrqStatus(status)
            }
            Request::CoreCount { device, kind } => Response::Count(self.core_count(device, kind)?),
            Request::CoreOffset { core } => {
                let (base, size) = self.core_offset(CoreId::from_raw(core)?)?;
                Response::Offset { base, size }
            }
            Request::PushRegs { core, regs } => {
                let core = CoreId::from_raw(core)?;
                self.device(core.device)?.push_regs(client.id(), core, &regs)?;
                Response::Done
            }
            Request::PullRegs { core, count } => {
                let core = CoreId::from_raw(core)?;
                Response::Registers(self.device(core.device)?.pull_regs(client.id(), core, count)?)
            }
            Request::WriteReg { core, reg, value } => {
                let core = CoreId::from_raw(core)?;
                self.device(core.device)?
                    .write_reg(client.id(), core, reg, value)?;
                Response::Done
            }
            Request::ReadReg { core, reg } => {
                let core = CoreId::from_raw(core)?;
                Response::Register(self.device(core.device)?.read_reg(client.id(), core, reg)?)
            }
            Request::WaitAndPull { core, count, timeout_ms } => {
                let core = CoreId::from_raw(core)?;
                let regs = self.device(core.device)?.wait_and_pull(
                    client,
                    core,
                    timeout(timeout_ms),
                    count,
                )?;
                Response::Registers(regs)
            }
            Request::ReserveEncoders { device, core_info } => {
                let request = EncoderRequest::from_core_info(core_info);
                let set = self.device(device)?.reserve_encoders(client, request)?;
                Response::Cores(set.bits())
            }
            Request::ReleaseEncoders { device, cores } => {
                self.device(device)?
                    .release_encoders(client.id(), CoreSet::from_bits(cores))?;
                Response::Done
            }
            Request::WaitEncoders { device, cores, timeout_ms } => {
                let (core, status) = self.device(device)?.wait_encoders(
                    client,
                    CoreSet::from_bits(cores),
                    timeout(timeout_ms),
                )?;
                Response::Completion {
                    core: core.to_raw(),
                    status,
                }
            }
            Request::ReservePostProcessor { device } => {
                self.device(device)?.reserve_post_processor(client)?;
                Response::Done
            }
            Request::ReleasePostProcessor { device } => {
                self.device(device)?.release_post_processor(client.id())?;
                Response::Done
            }
            Request::ReserveCache { device, binding } => {
                let core = self.device(device)?.reserve_cache(client, binding)?;
                Response::Core(core.to_raw())
            }
            Request::CoreForFormat { device, kind, format } => {
                match self.device(device)?.core_for_format(kind, format) {
                    Some(core) => Response::Core(core.to_raw()),
                    None => Response::NoCore,
                }
            }
            Request::AsicId { core } => {
                let core = CoreId::from_raw(core)?;
                Response::AsicId(self.device(core.device)?.asic_id(core)?)
            }
            Request::Abort { core } => {
                let core = CoreId::from_raw(core)?;
                self.device(core.device)?.abort(core)?;
                Response::Done
            }
            Request::MaskIrq { core } => {
                self.mask_core_irqs(CoreId::from_raw(core)?)?;
                Response::Done
            }
            Request::UnmaskIrq { core } => {
                self.unmask_core_irqs(CoreId::from_raw(core)?)?;
                Response::Done
            }
            Request::SetClockRate { device, hz } => {
                self.device(device)?.set_clock_policy(hz);
                Response::Done
            }
            Request::PollInterrupts { device } => {
                let outcome = self.device(device)?.poll_interrupts();
                Response::Interrupts {
                    delivered: outcome.delivered,
                    zombies: outcome.zombies,
                }
            }
            Request::Status { device } => Response::Status(self.device(device)?.status()),
        };
        Ok(response)
    }
}
