//! Device - One attached VPU instance and its three core families
//!
//! # Attach
//! Nodes are probed in descriptor order. Each decoder/encoder node maps its
//! window, runs the prober, and may bring an auxiliary core right behind
//! it in the list. Cache nodes read their ID first, then map the window of
//! the requested direction. A node that fails probing is unmapped and
//! skipped; the rest of the device still attaches. Every core is reset,
//! and with power gating on it is then idled until its first reservation.
//!
//! # Detach
//! Blocked callers are woken and fail with `DeviceNotFound`, every core is
//! reset and its window unmapped.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::arbiter::{CoreList, CoreSet, EncoderRequest};
use crate::client::{Client, ClientId};
use crate::config::BrokerConfig;
use crate::format::{CodecFormat, Formats};
use crate::irq::IrqOutcome;
use crate::mmio::RegionMapper;
use crate::power::{GatePolicy, PowerControl, PowerGate, PowerLines};
use crate::probe::{CapabilityProbe, Generation, ProbeReport, ID_REG};
use crate::registry::{Core, CoreId, CoreKind, DeviceId, PerfCounters};
use crate::regs::RegisterIo;
use crate::{BrokerError, Result, MAX_CORES_PER_LIST};

/// Interrupt lines a single node may carry
pub const MAX_NODE_IRQS: usize = 4;

/// Codec block a cache/shaper unit serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheClient {
    Vc8000e,
    Vc8000d0,
    Vc8000d1,
    Dec400,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDir {
    Read,
    Write,
}

/// What a cache unit is wired to; also the key a client reserves it by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheBinding {
    pub client: CacheClient,
    pub dir: CacheDir,
    pub parent: CoreKind,
    pub parent_index: usize,
}

/// One hardware node as described by the platform
#[derive(Debug, Clone, Deserialize)]
pub struct NodeDescriptor {
    pub kind: CoreKind,
    pub base: u64,
    pub size: usize,
    #[serde(default)]
    pub irqs: Vec<u32>,
    #[serde(default)]
    pub power: PowerLines,
    #[serde(default)]
    pub cache: Option<CacheBinding>,
}

/// Attach input for one device
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeDescriptor>,
}

/// Counters shared by the lists of one device
#[derive(Debug, Default)]
pub(crate) struct DeviceStats {
    pub irq_received: AtomicU64,
    pub irq_delivered: AtomicU64,
    pub timed_out: AtomicBool,
}

/// Everything attach needs from the owning context
pub(crate) struct AttachEnv<'a> {
    pub config: &'a BrokerConfig,
    pub mapper: Arc<dyn RegionMapper>,
    pub probe: &'a dyn CapabilityProbe,
    pub control: Arc<dyn PowerControl>,
}

/// An attached device
pub struct Device {
    id: DeviceId,
    name: String,
    decoders: CoreList,
    encoders: CoreList,
    caches: CoreList,
    config: BrokerConfig,
    stats: Arc<DeviceStats>,
    clock_hz: Arc<AtomicU64>,
    mapper: Arc<dyn RegionMapper>,
}

impl Device {
    pub(crate) fn attach(id: DeviceId, descriptor: &DeviceDescriptor, env: AttachEnv<'_>) -> Result<Self> {
        let stats = Arc::new(DeviceStats::default());
        let clock_hz = Arc::new(AtomicU64::new(0));
        let policy = GatePolicy {
            control: Arc::clone(&env.control),
            settle: env.config.settle_delay(),
            gating: env.config.power_gating,
            clock_hz: Arc::clone(&clock_hz),
        };

        let mut staged: [Vec<Core>; 3] = Default::default();
        for node in &descriptor.nodes {
            if !env.config.enabled(node.kind) {
                debug!("{}: {} node at {:#x} disabled", id, node.kind, node.base);
                continue;
            }
            let list = &mut staged[family(node.kind)];
            let first = list.len();
            let probed = if first >= MAX_CORES_PER_LIST {
                Err(BrokerError::InvalidRequest(format!(
                    "more than {MAX_CORES_PER_LIST} {} cores",
                    node.kind
                )))
            } else {
                match node.kind {
                    CoreKind::Cache => probe_cache_node(id, node, first, &env),
                    _ => probe_core_node(id, node, first, &env),
                }
            };

            match probed {
                Ok(cores) if first + cores.len() <= MAX_CORES_PER_LIST => list.extend(cores),
                Ok(cores) => {
                    warn!("{}: {} list full, dropping node at {:#x}", id, node.kind, node.base);
                    for core in cores {
                        env.mapper.unmap(core.base, core.size);
                    }
                }
                Err(e) => error!("{}: {} node at {:#x} skipped: {}", id, node.kind, node.base, e),
            }
        }

        let [decoders, encoders, caches] = staged;
        let list = |kind, cores| {
            CoreList::new(id, kind, cores, policy.clone(), Arc::clone(&stats))
        };
        let device = Self {
            id,
            name: descriptor.name.clone(),
            decoders: list(CoreKind::Decoder, decoders),
            encoders: list(CoreKind::Encoder, encoders),
            caches: list(CoreKind::Cache, caches),
            config: env.config.clone(),
            stats,
            clock_hz,
            mapper: env.mapper,
        };

        if device.lists().all(|l| l.is_empty()) {
            return Err(BrokerError::DeviceNotFound { device: id });
        }
        if device.config.power_gating {
            device.set_powered(false);
        }

        info!(
            "{} attached: {} decoder(s), {} encoder(s), {} cache unit(s)",
            id,
            device.decoders.len(),
            device.encoders.len(),
            device.caches.len()
        );
        Ok(device)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn decoders(&self) -> &CoreList {
        &self.decoders
    }

    pub fn encoders(&self) -> &CoreList {
        &self.encoders
    }

    pub fn caches(&self) -> &CoreList {
        &self.caches
    }

    pub fn list(&self, kind: CoreKind) -> &CoreList {
        match kind {
            CoreKind::Decoder => &self.decoders,
            CoreKind::Encoder => &self.encoders,
            CoreKind::Cache => &self.caches,
        }
    }

    pub(crate) fn lists(&self) -> impl Iterator<Item = &CoreList> {
        [&self.decoders, &self.encoders, &self.caches].into_iter()
    }

    fn enabled_list(&self, kind: CoreKind) -> Result<&CoreList> {
        if !self.config.enabled(kind) {
            return Err(BrokerError::Disabled { kind });
        }
        Ok(self.list(kind))
    }

    pub fn core_count(&self, kind: CoreKind) -> usize {
        self.list(kind).len()
    }

    /// Resolve a core handle on this device
    ///
    /// # Errors
    /// `CoreNotFound` if the handle names another device or no such index.
    pub fn core(&self, id: CoreId) -> Result<&Core> {
        if id.device != self.id {
            return Err(BrokerError::CoreNotFound { core: id });
        }
        self.list(id.kind).core(id.index)
    }

    /// Physical base and size of a core's register window
    pub fn core_offset(&self, id: CoreId) -> Result<(u64, usize)> {
        self.core(id).map(|core| (core.base(), core.size()))
    }

    /// Reserve the first free `kind` core that supports `format`
    ///
    /// # Errors
    /// `Disabled` for a family switched off in the configuration,
    /// `Unsupported` when no core of the family was probed with the format
    /// and `reject_unsupported` is set, `Interrupted` on cancellation.
    pub fn reserve(&self, client: &Client, kind: CoreKind, format: CodecFormat) -> Result<CoreId> {
        let list = self.enabled_list(kind)?;
        if self.config.reject_unsupported && !list.supports(format) {
            return Err(BrokerError::Unsupported { format });
        }
        let index = list.reserve(client, format)?;
        Ok(list.core_id(index))
    }

    pub fn release(&self, client: ClientId, core: CoreId) -> Result<()> {
        self.core(core)?;
        self.list(core.kind).release(client, core.index)
    }

    /// Wait for a completion on a held core
    ///
    /// `None` uses the configured default timeout.
    pub fn wait_ready(&self, client: &Client, core: CoreId, timeout: Option<Duration>) -> Result<u32> {
        self.core(core)?;
        let timeout = timeout.unwrap_or_else(|| self.config.wait_timeout());
        self.list(core.kind).wait_ready(client, core.index, timeout)
    }

    pub fn reserve_encoders(&self, client: &Client, request: EncoderRequest) -> Result<CoreSet> {
        self.enabled_list(CoreKind::Encoder)?
            .reserve_set(client, request)
    }

    pub fn release_encoders(&self, client: ClientId, set: CoreSet) -> Result<()> {
        self.encoders.release_set(client, set)
    }

    /// Wait for the first completion among held encoder cores
    pub fn wait_encoders(
        &self,
        client: &Client,
        set: CoreSet,
        timeout: Option<Duration>,
    ) -> Result<(CoreId, u32)> {
        let timeout = timeout.unwrap_or_else(|| self.config.wait_timeout());
        let (index, status) = self.encoders.wait_any(client, set, timeout)?;
        Ok((self.encoders.core_id(index), status))
    }

    fn held_core(&self, client: ClientId, core: CoreId, count: usize) -> Result<&Core> {
        self.core(core)?;
        let target = self.list(core.kind).held(client, core.index)?;
        if count > target.reg_count() {
            return Err(BrokerError::InvalidRequest(format!(
                "{count} registers requested, {} has {}",
                core,
                target.reg_count()
            )));
        }
        Ok(target)
    }

    /// Load a job into a held core
    ///
    /// Writing the status register, last, is what starts the job.
    ///
    /// # Errors
    /// `InvalidRequest` if `client` does not hold the core or `regs` is
    /// larger than its register window.
    pub fn push_regs(&self, client: ClientId, core: CoreId, regs: &[u32]) -> Result<()> {
        self.held_core(client, core, regs.len())?.push_regs(regs);
        debug!("{} pushed {} register(s) to {}", client, regs.len(), core);
        Ok(())
    }

    /// Read the first `count` registers of a held core
    pub fn pull_regs(&self, client: ClientId, core: CoreId, count: usize) -> Result<Vec<u32>> {
        Ok(self.held_core(client, core, count)?.pull_regs(count))
    }

    /// Write one register of a held core
    pub fn write_reg(&self, client: ClientId, core: CoreId, reg: usize, value: u32) -> Result<()> {
        self.held_core(client, core, reg.saturating_add(1))?.regs.write32(reg * 4, value);
        Ok(())
    }

    /// Read one register of a held core
    pub fn read_reg(&self, client: ClientId, core: CoreId, reg: usize) -> Result<u32> {
        Ok(self.held_core(client, core, reg.saturating_add(1))?.regs.read32(reg * 4))
    }

    /// Wait for a completion, then pull the job's registers
    ///
    /// # Errors
    /// As [`Device::wait_ready`]; nothing is read unless the job completed.
    pub fn wait_and_pull(
        &self,
        client: &Client,
        core: CoreId,
        timeout: Option<Duration>,
        count: usize,
    ) -> Result<Vec<u32>> {
        self.held_core(client.id(), core, count)?;
        self.wait_ready(client, core, timeout)?;
        self.pull_regs(client.id(), core, count)
    }

    /// Claim the post-processor that lives on decoder core 0
    pub fn reserve_post_processor(&self, client: &Client) -> Result<()> {
        let list = self.enabled_list(CoreKind::Decoder)?;
        let hosts_pp = list
            .cores()
            .first()
            .is_some_and(|core| core.formats().contains(Formats::PP));
        if !hosts_pp {
            return Err(BrokerError::Unsupported {
                format: CodecFormat::PostProcessor,
            });
        }
        list.reserve_pp(client)
    }

    pub fn release_post_processor(&self, client: ClientId) -> Result<()> {
        self.decoders.release_pp(client)
    }

    /// Reserve the cache unit wired as `binding`
    ///
    /// # Errors
    /// `InvalidRequest` when no unit matches client, direction and parent.
    pub fn reserve_cache(&self, client: &Client, binding: CacheBinding) -> Result<CoreId> {
        let list = self.enabled_list(CoreKind::Cache)?;
        let index = list
            .cores()
            .iter()
            .position(|core| core.cache() == Some(&binding))
            .ok_or_else(|| {
                BrokerError::InvalidRequest(format!("no cache unit for {binding:?} on {}", self.id))
            })?;
        list.reserve_index(client, index)?;
        Ok(list.core_id(index))
    }

    /// First `kind` core probed with `format`, without reserving it
    pub fn core_for_format(&self, kind: CoreKind, format: CodecFormat) -> Option<CoreId> {
        let list = self.list(kind);
        list.core_for_format(format).map(|index| list.core_id(index))
    }

    /// Run the interrupt handler of one family
    pub fn handle_irq(&self, kind: CoreKind) -> IrqOutcome {
        self.list(kind).handle_irq()
    }

    /// Run every family's handler; the polling path when IRQ mode is off
    pub fn poll_interrupts(&self) -> IrqOutcome {
        let mut outcome = IrqOutcome::default();
        for list in self.lists() {
            outcome += list.handle_irq();
        }
        outcome
    }

    /// Stop the job running on a core, interrupt disabled
    pub fn abort(&self, core: CoreId) -> Result<()> {
        let core = self.core(core)?;
        warn!("aborting {}", core.id());
        core.abort();
        Ok(())
    }

    /// Raw ID register of a core
    pub fn asic_id(&self, core: CoreId) -> Result<u32> {
        let core = self.core(core)?;
        Ok(match core.id().kind {
            // The cache window does not start at the ID register
            CoreKind::Cache => core.hw_id().0,
            _ => core.regs().read32(ID_REG),
        })
    }

    /// Set the device-wide clock rate applied at the next reservations
    ///
    /// Zero leaves rates untouched.
    pub fn set_clock_policy(&self, hz: u64) {
        self.clock_hz.store(hz, Ordering::Relaxed);
    }

    pub fn clock_policy(&self) -> u64 {
        self.clock_hz.load(Ordering::Relaxed)
    }

    /// Power every core up or down (runtime resume/suspend)
    pub fn set_powered(&self, on: bool) {
        for list in self.lists() {
            list.set_powered(on);
        }
    }

    /// Force-release everything `client` holds on this device
    pub fn release_client(&self, client: ClientId) -> usize {
        self.lists().map(|list| list.release_client(client)).sum()
    }

    /// Whether a completion wait has timed out since the last clear
    pub fn timed_out(&self) -> bool {
        self.stats.timed_out.load(Ordering::Relaxed)
    }

    pub fn clear_timeout(&self) {
        self.stats.timed_out.store(false, Ordering::Relaxed);
    }

    pub(crate) fn wake_all(&self) {
        for list in self.lists() {
            list.wake_all();
        }
    }

    pub(crate) fn detach(&self) {
        for list in self.lists() {
            list.detach();
            for core in list.cores() {
                core.reset();
                self.mapper.unmap(core.base(), core.size());
            }
        }
        info!("{} detached", self.id);
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            id: self.id,
            name: self.name.clone(),
            irq_received: self.stats.irq_received.load(Ordering::Relaxed),
            irq_delivered: self.stats.irq_delivered.load(Ordering::Relaxed),
            timed_out: self.timed_out(),
            clock_policy: self.clock_policy(),
            pp_owner: self.decoders.pp_owner(),
            cores: self.lists().flat_map(|list| list.status()).collect(),
        }
    }
}

fn family(kind: CoreKind) -> usize {
    match kind {
        CoreKind::Decoder => 0,
        CoreKind::Encoder => 1,
        CoreKind::Cache => 2,
    }
}

fn irq_lines(node: &NodeDescriptor) -> Vec<u32> {
    if node.irqs.len() > MAX_NODE_IRQS {
        warn!(
            "{} node at {:#x} lists {} IRQs, using the first {}",
            node.kind,
            node.base,
            node.irqs.len(),
            MAX_NODE_IRQS
        );
    }
    node.irqs.iter().copied().take(MAX_NODE_IRQS).collect()
}

#[allow(clippy::too_many_arguments)]
fn build_core(
    id: CoreId,
    base: u64,
    size: usize,
    regs: Arc<dyn RegisterIo>,
    report: &ProbeReport,
    formats: Formats,
    irq_lines: Vec<u32>,
    power: PowerLines,
) -> Core {
    Core {
        id,
        base,
        size,
        regs,
        hw_id: report.hw_id,
        generation: report.generation,
        formats,
        irq: report.irq,
        irq_lines,
        main: None,
        aux: None,
        cache: None,
        gate: PowerGate::new(power),
        perf: PerfCounters::default(),
    }
}

fn probe_core_node(
    device: DeviceId,
    node: &NodeDescriptor,
    first: usize,
    env: &AttachEnv<'_>,
) -> Result<Vec<Core>> {
    let regs = env.mapper.map(node.base, node.size)?;
    let report = match env.probe.probe(node.kind, node.base, regs.as_ref()) {
        Ok(report) => report,
        Err(e) => {
            env.mapper.unmap(node.base, node.size);
            return Err(e);
        }
    };

    let lines = irq_lines(node);
    let mut main = build_core(
        CoreId::new(device, node.kind, first),
        node.base,
        node.size,
        regs,
        &report,
        report.formats,
        lines.clone(),
        node.power,
    );

    let mut cores = Vec::with_capacity(2);
    if let Some(aux) = report.aux {
        let aux_regs = match offset_base(node.base, aux.offset)
            .and_then(|aux_base| env.mapper.map(aux_base, node.size))
        {
            Ok(regs) => regs,
            Err(e) => {
                env.mapper.unmap(node.base, node.size);
                return Err(e);
            }
        };
        // The aux core shares the main core's lines; it is not gated on
        // its own.
        let aux_base = node.base + aux.offset;
        let mut aux_core = build_core(
            CoreId::new(device, node.kind, first + 1),
            aux_base,
            node.size,
            aux_regs,
            &report,
            aux.formats,
            lines,
            PowerLines::default(),
        );
        aux_core.main = Some(first);
        main.aux = Some(first + 1);
        info!(
            "{}: aux core at {:#x} pipelines {}",
            device, aux_base, aux.formats
        );
        cores.push(main);
        cores.push(aux_core);
    } else {
        cores.push(main);
    }

    for core in &cores {
        core.reset();
    }
    Ok(cores)
}

fn offset_base(base: u64, offset: u64) -> Result<u64> {
    base.checked_add(offset).ok_or_else(|| {
        BrokerError::InvalidRequest(format!("window {base:#x}+{offset:#x} wraps"))
    })
}

fn probe_cache_node(
    device: DeviceId,
    node: &NodeDescriptor,
    index: usize,
    env: &AttachEnv<'_>,
) -> Result<Vec<Core>> {
    let binding = node.cache.ok_or_else(|| {
        BrokerError::InvalidRequest(format!("cache node at {:#x} has no binding", node.base))
    })?;

    let id_window = env.mapper.map(node.base, 4)?;
    let hw_id = id_window.read32(ID_REG);
    drop(id_window);
    env.mapper.unmap(node.base, 4);

    let (offset, report) = env.probe.probe_cache(node.base, hw_id, binding.dir)?;
    let base = offset_base(node.base, offset)?;
    let regs = env.mapper.map(base, node.size)?;

    let mut core = build_core(
        CoreId::new(device, CoreKind::Cache, index),
        base,
        node.size,
        regs,
        &report,
        Formats::empty(),
        irq_lines(node),
        node.power,
    );
    core.cache = Some(binding);
    core.reset();
    Ok(vec![core])
}

/// Snapshot of one core
#[derive(Debug, Clone)]
pub struct CoreStatus {
    pub id: CoreId,
    pub base: u64,
    pub generation: Generation,
    /// Probed mask
    pub formats: Formats,
    /// Mask as currently narrowed
    pub current: Formats,
    pub owner: Option<ClientId>,
    pub pending: bool,
    pub irq_status: u32,
    pub powered: bool,
    pub reservations: u64,
    pub busy: Duration,
}

impl fmt::Display for CoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @{:#x} {} [{}]",
            self.id, self.base, self.generation, self.formats
        )?;
        if self.current != self.formats {
            write!(f, " narrowed to [{}]", self.current)?;
        }
        match self.owner {
            Some(owner) => write!(f, " owner {owner}")?,
            None => f.write_str(" free")?,
        }
        if self.pending {
            write!(f, " pending {:#x}", self.irq_status)?;
        }
        write!(
            f,
            " {} reservations {} busy {:?}",
            if self.powered { "on" } else { "off" },
            self.reservations,
            self.busy
        )
    }
}

/// Snapshot of one device
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub name: String,
    pub irq_received: u64,
    pub irq_delivered: u64,
    pub timed_out: bool,
    pub clock_policy: u64,
    pub pp_owner: Option<ClientId>,
    pub cores: Vec<CoreStatus>,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {:?}: irq rx {} tx {}, timeout {}, clock policy {}",
            self.id,
            self.name,
            self.irq_received,
            self.irq_delivered,
            if self.timed_out { "yes" } else { "no" },
            self.clock_policy
        )?;
        if let Some(owner) = self.pp_owner {
            writeln!(f, "  post-processor held by {owner}")?;
        }
        for core in &self.cores {
            writeln!(f, "  {core}")?;
        }
        Ok(())
    }
}
