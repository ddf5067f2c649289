//! Core Registry - Descriptors of probed hardware cores
//!
//! A [`Core`] is built once at attach and never moves or changes identity
//! until detach. Everything mutable about reservations lives in the
//! owning [`crate::CoreList`]; a core itself only carries its register
//! window, what the prober learned about it, its pairing back-references
//! and its power gate.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};

use crate::device::CacheBinding;
use crate::format::Formats;
use crate::power::PowerGate;
use crate::probe::{AbortMethod, Generation, HwId, IrqScheme, ID_REG};
use crate::regs::RegisterIo;
use crate::{BrokerError, Result};

/// Devices one [`crate::Context`] can hold; the device field of a raw
/// [`CoreId`] handle is 8 bits wide
pub const MAX_DEVICES: usize = 256;

/// Index of an attached device within its [`crate::Context`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Core family; each family has its own list per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreKind {
    Decoder,
    Encoder,
    Cache,
}

impl CoreKind {
    pub const ALL: [CoreKind; 3] = [CoreKind::Decoder, CoreKind::Encoder, CoreKind::Cache];

    fn tag(self) -> u32 {
        match self {
            CoreKind::Decoder => 0,
            CoreKind::Encoder => 1,
            CoreKind::Cache => 2,
        }
    }
}

impl fmt::Display for CoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoreKind::Decoder => "decoder",
            CoreKind::Encoder => "encoder",
            CoreKind::Cache => "cache",
        };
        f.write_str(name)
    }
}

/// Stable handle of one core: device, family and position in the list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreId {
    pub device: DeviceId,
    pub kind: CoreKind,
    pub index: usize,
}

impl CoreId {
    pub fn new(device: DeviceId, kind: CoreKind, index: usize) -> Self {
        Self { device, kind, index }
    }

    /// Pack into the 32-bit handle used by the ioctl layer
    ///
    /// Layout: bits 31:24 family, 23:16 device, 15:0 index.
    pub fn to_raw(self) -> u32 {
        (self.kind.tag() << 24) | ((self.device.0 & 0xff) << 16) | (self.index as u32 & 0xffff)
    }

    /// Unpack a handle produced by [`CoreId::to_raw`]
    ///
    /// # Errors
    /// `InvalidRequest` if the family tag is unknown.
    pub fn from_raw(raw: u32) -> Result<Self> {
        let kind = match raw >> 24 {
            0 => CoreKind::Decoder,
            1 => CoreKind::Encoder,
            2 => CoreKind::Cache,
            tag => {
                return Err(BrokerError::InvalidRequest(format!(
                    "unknown core family {tag} in handle {raw:#010x}"
                )))
            }
        };
        Ok(Self {
            device: DeviceId((raw >> 16) & 0xff),
            kind,
            index: (raw & 0xffff) as usize,
        })
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.device, self.kind, self.index)
    }
}

/// Reservation statistics of one core
#[derive(Debug, Default)]
pub struct PerfCounters {
    reservations: AtomicU64,
    busy_ns: AtomicU64,
    active_since: AtomicCell<Option<Instant>>,
    last_reserved: AtomicCell<Option<Instant>>,
}

impl PerfCounters {
    pub(crate) fn mark_reserved(&self) {
        let now = Instant::now();
        self.active_since.store(Some(now));
        self.last_reserved.store(Some(now));
    }

    pub(crate) fn mark_released(&self) {
        if let Some(since) = self.active_since.take() {
            let busy = since.elapsed().as_nanos().min(u64::MAX as u128) as u64;
            self.busy_ns.fetch_add(busy, Ordering::Relaxed);
            self.reservations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Completed reservations
    pub fn reservations(&self) -> u64 {
        self.reservations.load(Ordering::Relaxed)
    }

    /// Total time spent reserved over completed reservations
    pub fn busy_time(&self) -> Duration {
        Duration::from_nanos(self.busy_ns.load(Ordering::Relaxed))
    }

    pub fn last_reserved(&self) -> Option<Instant> {
        self.last_reserved.load()
    }
}

/// One probed hardware core
pub struct Core {
    pub(crate) id: CoreId,
    pub(crate) base: u64,
    pub(crate) size: usize,
    pub(crate) regs: Arc<dyn RegisterIo>,
    pub(crate) hw_id: HwId,
    pub(crate) generation: Generation,
    pub(crate) formats: Formats,
    pub(crate) irq: IrqScheme,
    pub(crate) irq_lines: Vec<u32>,
    pub(crate) main: Option<usize>,
    pub(crate) aux: Option<usize>,
    pub(crate) cache: Option<CacheBinding>,
    pub(crate) gate: PowerGate,
    pub(crate) perf: PerfCounters,
}

impl Core {
    pub fn id(&self) -> CoreId {
        self.id
    }

    /// Physical base of the register window
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Register window
    pub fn regs(&self) -> &dyn RegisterIo {
        self.regs.as_ref()
    }

    /// Number of 32-bit registers in the window
    pub fn reg_count(&self) -> usize {
        self.size / 4
    }

    pub fn hw_id(&self) -> HwId {
        self.hw_id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Probed capability mask (the backup that narrowing restores to)
    pub fn formats(&self) -> Formats {
        self.formats
    }

    pub fn irq_lines(&self) -> &[u32] {
        &self.irq_lines
    }

    /// Index of the main core if this is an auxiliary core
    pub fn main(&self) -> Option<usize> {
        self.main
    }

    /// Index of the auxiliary core sharing this core's pipeline
    pub fn aux(&self) -> Option<usize> {
        self.aux
    }

    /// Pipeline partner in either direction
    pub fn partner(&self) -> Option<usize> {
        self.aux.or(self.main)
    }

    pub fn cache(&self) -> Option<&CacheBinding> {
        self.cache.as_ref()
    }

    pub fn is_powered(&self) -> bool {
        self.gate.is_enabled()
    }

    pub fn clock_rate(&self) -> u64 {
        self.gate.clock_rate()
    }

    pub fn perf(&self) -> &PerfCounters {
        &self.perf
    }

    /// Read and acknowledge a completion interrupt
    ///
    /// Returns the status to hand to the waiter, or `None` when the core
    /// did not raise a completion.
    pub(crate) fn ack_interrupt(&self) -> Option<u32> {
        let scheme = &self.irq;
        let status = self.regs.read32(scheme.status_offset);
        if status & scheme.done_mask == 0 {
            return None;
        }
        if let Some((bit, control)) = scheme.overflow {
            if status & bit != 0 {
                self.regs.write32(control, 0);
            }
        }
        self.regs
            .write32(scheme.status_offset, scheme.clear.clear_value(status));
        Some(status & !scheme.report_strip)
    }

    /// Load a job's registers, `regs[i]` going to register `i`
    ///
    /// On decoders and encoders the read-only ID register is skipped and
    /// the status register is zeroed first and written last, since writing
    /// it may start the core. Cache units take the words in order.
    pub(crate) fn push_regs(&self, regs: &[u32]) {
        if self.id.kind == CoreKind::Cache {
            for (i, &value) in regs.iter().enumerate() {
                self.regs.write32(i * 4, value);
            }
            return;
        }

        let status = self.irq.status_offset;
        self.regs.write32(status, 0);
        for (i, &value) in regs.iter().enumerate() {
            let offset = i * 4;
            if offset != ID_REG && offset != status {
                self.regs.write32(offset, value);
            }
        }
        if let Some(&value) = regs.get(status / 4) {
            self.regs.write32(status, value);
        }
    }

    /// Read back the first `count` registers
    pub(crate) fn pull_regs(&self, count: usize) -> Vec<u32> {
        (0..count).map(|i| self.regs.read32(i * 4)).collect()
    }

    /// Whether the hardware is still processing a job
    pub(crate) fn is_running(&self) -> bool {
        match self.irq.abort {
            AbortMethod::None => false,
            AbortMethod::StatusBits { enable, .. } => {
                self.regs.read32(self.irq.status_offset) & enable != 0
            }
            AbortMethod::ZeroControl { offset, enable } => self.regs.read32(offset) & enable != 0,
        }
    }

    /// Stop the running job with its interrupt disabled
    pub(crate) fn abort(&self) {
        match self.irq.abort {
            AbortMethod::None => {}
            AbortMethod::StatusBits { bits, .. } => {
                let status = self.regs.read32(self.irq.status_offset);
                self.regs.write32(self.irq.status_offset, status | bits);
            }
            AbortMethod::ZeroControl { offset, .. } => self.regs.write32(offset, 0),
        }
    }

    /// Abort only if a job is still running; returns true if it was
    pub(crate) fn abort_if_running(&self) -> bool {
        let running = self.is_running();
        if running {
            self.abort();
        }
        running
    }

    /// Bring the unit to a known idle state
    pub(crate) fn reset(&self) {
        match self.id.kind {
            CoreKind::Cache => {
                for offset in (0..self.size).step_by(4) {
                    self.regs.write32(offset, 0);
                }
            }
            CoreKind::Decoder | CoreKind::Encoder => {
                self.abort_if_running();
                self.regs.write32(self.irq.status_offset, 0);
            }
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("hw_id", &self.hw_id)
            .field("generation", &self.generation)
            .field("formats", &self.formats)
            .field("main", &self.main)
            .field("aux", &self.aux)
            .finish()
    }
}
