//! VPU Broker - Multi-core arbitration for Hantro video codec hardware
//!
//! # Purpose
//! A device carries a fixed pool of decoder, encoder and cache/shaper cores
//! that many clients share. The broker hands each client exclusive,
//! format-matched ownership of one or more cores for the duration of a job,
//! delivers hardware completion interrupts to the blocked owner, and couples
//! each core's clock/reset/power-domain lines to its reservation state.
//!
//! # Integration Points
//! - Depends on: a [`RegionMapper`] (register windows), a [`PowerControl`]
//!   (clock/reset/power-domain lines), a [`CapabilityProbe`] (ID decode)
//! - Provides to: the ioctl layer, through [`Context`] and [`Request`]
//! - Interrupts: the platform calls [`Context::dispatch_irq`] per line
//!
//! # Architecture
//! A [`Context`] owns every attached [`Device`]. A device owns one
//! [`CoreList`] per family (decoders, encoders, caches). Cores live in a
//! stable arena indexed by position; all mutable ownership state of a list
//! sits behind one short-held lock with two condition variables, one for
//! "a core became free" and one for "an interrupt became pending". Power
//! transitions use a separate per-core lock and may sleep.
//!
//! # Testing Strategy
//! - Unit tests: probe decode, narrowing, IRQ clear rules, power sequencing
//! - Integration tests: concurrent clients on simulated register banks
//! - Hardware sim tests: [`sim::SimBus`] backs every test and the CLI tool

mod arbiter;
mod client;
mod config;
mod context;
mod control;
mod device;
mod format;
mod irq;
mod mmio;
mod power;
pub mod probe;
mod registry;
mod regs;
pub mod sim;

pub use arbiter::{CoreList, CoreSet, EncoderRequest, CORE_INFO_AMOUNT_OFFSET};
pub use client::{Client, ClientId};
pub use config::BrokerConfig;
pub use context::Context;
pub use control::{Request, Response};
pub use registry::{Core, CoreId, CoreKind, DeviceId, PerfCounters, MAX_DEVICES};
pub use device::{
    CacheBinding, CacheClient, CacheDir, CoreStatus, Device, DeviceDescriptor,
    DeviceStatus, NodeDescriptor, MAX_NODE_IRQS,
};
pub use format::{CodecFormat, Formats};
pub use irq::{IrqOutcome, IrqTable};
pub use mmio::{align_down, align_up, pages_needed, LinearMapper, RegionMapper, ReservationTable, PAGE_SIZE};
pub use power::{NoPowerControl, PowerControl, PowerEvent, PowerLines, RecordingPowerControl};
pub use probe::{
    AbortMethod, AuxReport, CapabilityProbe, ClearMode, Generation, HantroProbe, HwId, IrqScheme,
    ProbeReport,
};
pub use regs::{MmioRegion, RegisterIo};

use static_assertions::const_assert;
use thiserror::Error;

/// Largest number of cores one family list may hold (bitmap width)
pub const MAX_CORES_PER_LIST: usize = 32;

const_assert!(MAX_CORES_PER_LIST <= u32::BITS as usize);
const_assert!(MAX_DEVICES <= 1 << 8);

/// Error types for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Device not found: {device}")]
    DeviceNotFound { device: DeviceId },

    #[error("Core not found: {core}")]
    CoreNotFound { core: CoreId },

    #[error("No core supports format {format}")]
    Unsupported { format: CodecFormat },

    #[error("Timed out waiting for {core}")]
    Timeout { core: CoreId },

    #[error("Interrupted while blocked")]
    Interrupted,

    #[error("Release of {core} by a client that does not own it")]
    BogusRelease { core: CoreId },

    #[error("Unknown hardware at {base:#x} (ID {id:#010x})")]
    UnknownHardware { base: u64, id: u32 },

    #[error("Register window {base:#x}+{size:#x} already claimed")]
    RegionBusy { base: u64, size: usize },

    #[error("Invalid cache configuration at {base:#x} (ID {id:#010x})")]
    InvalidCache { base: u64, id: u32 },

    #[error("IRQ line {line} already registered for this core")]
    IrqAlreadyRegistered { line: u32 },

    #[error("All {max} device slots are in use")]
    NoDeviceSlot { max: usize },

    #[error("{kind} cores are disabled")]
    Disabled { kind: CoreKind },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl BrokerError {
    /// Map to the negative errno returned by the ioctl layer
    pub fn as_errno(&self) -> i32 {
        const EINTR: i32 = 4;
        const EFAULT: i32 = 14;
        const EBUSY: i32 = 16;
        const ENODEV: i32 = 19;
        const EINVAL: i32 = 22;
        const EOPNOTSUPP: i32 = 95;

        let errno = match self {
            BrokerError::DeviceNotFound { .. }
            | BrokerError::CoreNotFound { .. }
            | BrokerError::UnknownHardware { .. }
            | BrokerError::Disabled { .. } => ENODEV,
            BrokerError::Unsupported { .. } => EOPNOTSUPP,
            BrokerError::Timeout { .. }
            | BrokerError::RegionBusy { .. }
            | BrokerError::IrqAlreadyRegistered { .. }
            | BrokerError::NoDeviceSlot { .. } => EBUSY,
            BrokerError::Interrupted => EINTR,
            BrokerError::BogusRelease { .. } => EFAULT,
            BrokerError::InvalidCache { .. } | BrokerError::InvalidRequest(_) => EINVAL,
        };
        -errno
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
