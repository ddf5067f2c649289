//! Reservation Arbiter - Exclusive, format-matched core ownership
//!
//! Every family list of a device carries one [`ListState`] behind a
//! mutex: per-core owner, current (possibly narrowed) capability mask,
//! pending-interrupt flag and last status. Two condition variables hang
//! off the same mutex: `free` is signalled whenever a core or the
//! post-processor is given back, `done` whenever the interrupt bridge marks
//! a completion. Waiters always re-run their full predicate after a wake.
//!
//! Claims are strict first-fit in list order. Claiming a core that has a
//! pipeline partner narrows the partner to the claimed format (or to
//! nothing if it cannot do that format); releasing restores the partner's
//! probed mask.
//!
//! Power transitions happen after the ownership lock is dropped.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::client::{Client, ClientId};
use crate::device::{CoreStatus, DeviceStats};
use crate::format::{CodecFormat, Formats};
use crate::power::GatePolicy;
use crate::probe::{PP_E, PP_IRQ_DISABLE, PP_STATUS_REG};
use crate::registry::{Core, CoreId, CoreKind, DeviceId};
use crate::{BrokerError, Result, MAX_CORES_PER_LIST};

/// Bit position of the core count in a packed encoder request
pub const CORE_INFO_AMOUNT_OFFSET: u32 = 28;

/// Set of core indices within one list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CoreSet(u32);

impl CoreSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Indices `0..count`
    pub fn first(count: usize) -> Self {
        if count >= MAX_CORES_PER_LIST {
            Self(u32::MAX)
        } else {
            Self((1u32 << count) - 1)
        }
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, index: usize) -> bool {
        index < MAX_CORES_PER_LIST && self.0 & (1 << index) != 0
    }

    pub fn insert(&mut self, index: usize) {
        if index < MAX_CORES_PER_LIST {
            self.0 |= 1 << index;
        }
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersection(self, other: CoreSet) -> Self {
        Self(self.0 & other.0)
    }

    /// Indices in ascending order
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_CORES_PER_LIST).filter(move |&i| self.contains(i))
    }
}

impl FromIterator<usize> for CoreSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CoreSet::empty();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

/// Multi-core claim: `count` cores out of the `cores` bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderRequest {
    pub cores: CoreSet,
    pub count: usize,
}

impl EncoderRequest {
    pub fn new(cores: CoreSet, count: usize) -> Self {
        Self { cores, count }
    }

    /// Unpack the ioctl form: bitmap in bits 7:0, count - 1 in bits 30:28
    pub fn from_core_info(info: u32) -> Self {
        Self {
            cores: CoreSet::from_bits(info & 0xff),
            count: ((info >> CORE_INFO_AMOUNT_OFFSET) & 0x7) as usize + 1,
        }
    }

    pub fn to_core_info(self) -> u32 {
        let amount = (self.count.saturating_sub(1) as u32 & 0x7) << CORE_INFO_AMOUNT_OFFSET;
        amount | (self.cores.bits() & 0xff)
    }
}

/// Mutable reservation state of one core
#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub owner: Option<ClientId>,
    /// Current capability mask; narrower than the probed one while the
    /// pipeline partner is held
    pub formats: Formats,
    pub pending: bool,
    pub irq_status: u32,
}

#[derive(Debug)]
pub(crate) struct ListState {
    pub slots: Vec<Slot>,
    pub pp_owner: Option<ClientId>,
    pub detached: bool,
}

/// Why a blocking call gave up
enum Blocked {
    Interrupted,
    TimedOut,
    Detached,
}

/// Cores of one family on one device, with their reservation state
pub struct CoreList {
    pub(crate) device: DeviceId,
    pub(crate) kind: CoreKind,
    pub(crate) cores: Vec<Core>,
    pub(crate) state: Mutex<ListState>,
    pub(crate) free: Condvar,
    pub(crate) done: Condvar,
    pub(crate) policy: GatePolicy,
    pub(crate) stats: Arc<DeviceStats>,
}

impl CoreList {
    pub(crate) fn new(
        device: DeviceId,
        kind: CoreKind,
        cores: Vec<Core>,
        policy: GatePolicy,
        stats: Arc<DeviceStats>,
    ) -> Self {
        let slots = cores
            .iter()
            .map(|core| Slot {
                formats: core.formats,
                ..Slot::default()
            })
            .collect();
        Self {
            device,
            kind,
            cores,
            state: Mutex::new(ListState {
                slots,
                pp_owner: None,
                detached: false,
            }),
            free: Condvar::new(),
            done: Condvar::new(),
            policy,
            stats,
        }
    }

    pub fn kind(&self) -> CoreKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    /// Core at `index`
    ///
    /// # Errors
    /// `CoreNotFound` when the index is past the end of the list.
    pub fn core(&self, index: usize) -> Result<&Core> {
        self.cores
            .get(index)
            .ok_or(BrokerError::CoreNotFound { core: self.core_id(index) })
    }

    pub(crate) fn core_id(&self, index: usize) -> CoreId {
        CoreId::new(self.device, self.kind, index)
    }

    /// Whether any core was probed with `format`
    pub fn supports(&self, format: CodecFormat) -> bool {
        self.cores.iter().any(|c| c.formats.contains(format.flag()))
    }

    /// First core whose probed mask has `format`, without reserving it
    pub fn core_for_format(&self, format: CodecFormat) -> Option<usize> {
        self.cores
            .iter()
            .position(|c| c.formats.contains(format.flag()))
    }

    pub fn owner(&self, index: usize) -> Option<ClientId> {
        self.lock().slots.get(index).and_then(|s| s.owner)
    }

    /// Capability mask as currently narrowed
    pub fn current_formats(&self, index: usize) -> Option<Formats> {
        self.lock().slots.get(index).map(|s| s.formats)
    }

    /// The core at `index`, provided `client` holds it
    ///
    /// # Errors
    /// `CoreNotFound` for an index past the end, `InvalidRequest` when the
    /// core is free or held by someone else.
    pub fn held(&self, client: ClientId, index: usize) -> Result<&Core> {
        let core = self.core(index)?;
        let owner = self.lock().slots[index].owner;
        if owner != Some(client) {
            return Err(BrokerError::InvalidRequest(format!(
                "{} does not hold {}",
                client, core.id
            )));
        }
        Ok(core)
    }

    pub fn pp_owner(&self) -> Option<ClientId> {
        self.lock().pp_owner
    }

    pub fn free_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.owner.is_none()).count()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ListState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `attempt` under the list lock until it yields a value
    ///
    /// Sleeps on `queue` between attempts. A pending cancellation of
    /// `client` is consumed only when the call would otherwise sleep.
    fn block_on<T>(
        &self,
        client: &Client,
        queue: &Condvar,
        deadline: Option<Instant>,
        mut attempt: impl FnMut(&mut ListState) -> Option<T>,
    ) -> std::result::Result<T, Blocked> {
        let mut state = self.lock();
        loop {
            if state.detached {
                return Err(Blocked::Detached);
            }
            if let Some(value) = attempt(&mut *state) {
                return Ok(value);
            }
            if client.take_interrupt() {
                return Err(Blocked::Interrupted);
            }
            state = match deadline {
                None => queue.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Blocked::TimedOut);
                    }
                    queue
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn blocked_error(&self, blocked: Blocked, index: usize) -> BrokerError {
        match blocked {
            Blocked::Interrupted => BrokerError::Interrupted,
            Blocked::Detached => BrokerError::DeviceNotFound { device: self.device },
            Blocked::TimedOut => {
                self.stats.timed_out.store(true, Ordering::Relaxed);
                let core = self.core_id(index);
                warn!("{} completion wait timed out", core);
                BrokerError::Timeout { core }
            }
        }
    }

    fn claim(&self, state: &mut ListState, index: usize, client: ClientId) {
        let slot = &mut state.slots[index];
        slot.owner = Some(client);
        slot.pending = false;
        slot.irq_status = 0;
        self.cores[index].gate.bump_epoch();
    }

    fn claim_format(&self, state: &mut ListState, client: ClientId, flag: Formats) -> Option<usize> {
        let index = state
            .slots
            .iter()
            .position(|s| s.owner.is_none() && s.formats.contains(flag))?;
        self.claim(state, index, client);

        if let Some(partner) = self.cores[index].partner() {
            state.slots[partner].formats = if self.cores[partner].formats.contains(flag) {
                flag
            } else {
                Formats::empty()
            };
        }
        Some(index)
    }

    /// Clear ownership and undo partner narrowing; returns the claim epoch
    fn free_slot(&self, state: &mut ListState, index: usize) -> u64 {
        let slot = &mut state.slots[index];
        slot.owner = None;
        slot.pending = false;
        slot.irq_status = 0;

        if let Some(partner) = self.cores[index].partner() {
            state.slots[partner].formats = self.cores[partner].formats;
        }
        self.cores[index].gate.epoch()
    }

    /// Wake claimers and completion waiters after cores were given back
    fn notify_released(&self) {
        self.free.notify_all();
        self.done.notify_all();
    }

    fn power_up(&self, index: usize) {
        let core = &self.cores[index];
        let control = self.policy.control.as_ref();
        if self.policy.gating {
            core.gate.activate(core.id, control, self.policy.settle);
        }
        core.gate.apply_rate(control, self.policy.clock_policy());
        core.perf.mark_reserved();
    }

    fn power_down(&self, index: usize, epoch: u64) {
        let core = &self.cores[index];
        core.perf.mark_released();
        if self.policy.gating {
            core.gate.deactivate_if_idle(
                core.id,
                epoch,
                self.policy.control.as_ref(),
                self.policy.settle,
            );
        }
    }

    /// Reserve the first free core supporting `format`, blocking until one
    /// is available
    ///
    /// # Returns
    /// Index of the claimed core, already powered up.
    ///
    /// # Errors
    /// `Interrupted` on cancellation, `DeviceNotFound` if the device is
    /// detached while blocked.
    pub fn reserve(&self, client: &Client, format: CodecFormat) -> Result<usize> {
        let id = client.id();
        let flag = format.flag();
        let index = self
            .block_on(client, &self.free, None, |state| {
                self.claim_format(state, id, flag)
            })
            .map_err(|b| self.blocked_error(b, 0))?;

        self.power_up(index);
        debug!("{} reserved {} for {}", id, self.core_id(index), format);
        Ok(index)
    }

    /// Reserve the core at `index`, blocking while someone else holds it
    pub fn reserve_index(&self, client: &Client, index: usize) -> Result<()> {
        self.core(index)?;
        let id = client.id();
        self.block_on(client, &self.free, None, |state| {
            if state.slots[index].owner.is_some() {
                return None;
            }
            self.claim(state, index, id);
            Some(())
        })
        .map_err(|b| self.blocked_error(b, index))?;

        self.power_up(index);
        debug!("{} reserved {}", id, self.core_id(index));
        Ok(())
    }

    /// Give back a core
    ///
    /// A job still running on the core is aborted first.
    ///
    /// # Errors
    /// `BogusRelease` if `client` does not own the core; nothing changes.
    pub fn release(&self, client: ClientId, index: usize) -> Result<()> {
        let core = self.core(index)?;
        let epoch = {
            let mut state = self.lock();
            let owner = state.slots[index].owner;
            if owner != Some(client) {
                warn!("{} released {} held by {:?}", client, core.id, owner);
                return Err(BrokerError::BogusRelease { core: core.id });
            }
            if core.abort_if_running() {
                warn!("{} still running at release, aborted", core.id);
            }
            self.free_slot(&mut state, index)
        };
        self.notify_released();
        self.power_down(index, epoch);

        debug!("{} released {}", client, core.id);
        Ok(())
    }

    /// Claim exactly `request.count` cores out of `request.cores`
    ///
    /// Cores claimed on an earlier pass stay claimed while the call blocks
    /// for the rest; a pass first drops any of them the caller no longer
    /// owns. Success is only reported with the full count held.
    ///
    /// # Errors
    /// `InvalidRequest` if the bitmap names fewer existing cores than the
    /// count. On `Interrupted` the partial claims stay with the caller
    /// until it releases them or is torn down.
    pub fn reserve_set(&self, client: &Client, request: EncoderRequest) -> Result<CoreSet> {
        let eligible = request.cores.intersection(CoreSet::first(self.len()));
        if request.count == 0 || request.count > eligible.len() {
            return Err(BrokerError::InvalidRequest(format!(
                "{} of {:#x} requested, {} {}s exist there",
                request.count,
                request.cores.bits(),
                eligible.len(),
                self.kind
            )));
        }

        let id = client.id();
        let mut claimed = CoreSet::empty();
        let set = self
            .block_on(client, &self.free, None, |state| {
                claimed = claimed
                    .iter()
                    .filter(|&i| state.slots[i].owner == Some(id))
                    .collect();
                for index in eligible.iter() {
                    if claimed.len() == request.count {
                        break;
                    }
                    if !claimed.contains(index) && state.slots[index].owner.is_none() {
                        self.claim(state, index, id);
                        claimed.insert(index);
                    }
                }
                (claimed.len() == request.count).then_some(claimed)
            })
            .map_err(|b| self.blocked_error(b, 0))?;

        for index in set.iter() {
            self.power_up(index);
        }
        debug!("{} reserved {}s {:#x}", id, self.kind, set.bits());
        Ok(set)
    }

    /// Give back every core of `set`
    ///
    /// # Errors
    /// `BogusRelease` naming the first core `client` does not own; in that
    /// case none of the set is released.
    pub fn release_set(&self, client: ClientId, set: CoreSet) -> Result<()> {
        let mut freed = Vec::with_capacity(set.len());
        {
            let mut state = self.lock();
            for index in set.iter() {
                if state.slots.get(index).and_then(|s| s.owner) != Some(client) {
                    let core = self.core_id(index);
                    warn!("{} released {} it does not hold", client, core);
                    return Err(BrokerError::BogusRelease { core });
                }
            }
            for index in set.iter() {
                if self.cores[index].abort_if_running() {
                    warn!("{} still running at release, aborted", self.core_id(index));
                }
                freed.push((index, self.free_slot(&mut state, index)));
            }
        }
        self.notify_released();
        for (index, epoch) in freed {
            self.power_down(index, epoch);
        }

        debug!("{} released {}s {:#x}", client, self.kind, set.bits());
        Ok(())
    }

    /// Claim the post-processor hosted on core 0
    pub fn reserve_pp(&self, client: &Client) -> Result<()> {
        self.core(0)?;
        let id = client.id();
        self.block_on(client, &self.free, None, |state| {
            if state.pp_owner.is_some() {
                return None;
            }
            state.pp_owner = Some(id);
            Some(())
        })
        .map_err(|b| self.blocked_error(b, 0))?;

        debug!("{} reserved the post-processor of {}", id, self.device);
        Ok(())
    }

    pub fn release_pp(&self, client: ClientId) -> Result<()> {
        let core = self.core(0)?;
        {
            let mut state = self.lock();
            if state.pp_owner != Some(client) {
                warn!("{} released a post-processor it does not hold", client);
                return Err(BrokerError::BogusRelease { core: core.id });
            }
            Self::stop_pp(core);
            state.pp_owner = None;
        }
        self.free.notify_all();
        Ok(())
    }

    fn stop_pp(core: &Core) {
        if core.regs.read32(PP_STATUS_REG) & PP_E != 0 {
            warn!("post-processor on {} still running, disabled", core.id);
            core.regs.write32(PP_STATUS_REG, PP_IRQ_DISABLE);
        }
    }

    /// Block until the core at `index` has a completion for its owner
    ///
    /// # Returns
    /// The interrupt status recorded by the bridge.
    ///
    /// # Errors
    /// `Timeout` after `timeout` (sets the device's sticky timeout flag,
    /// ownership is untouched), `Interrupted` on cancellation,
    /// `InvalidRequest` if `client` does not hold the core, or stops holding
    /// it while waiting.
    pub fn wait_ready(&self, client: &Client, index: usize, timeout: Duration) -> Result<u32> {
        self.wait_any(client, CoreSet::from_iter([index]), timeout)
            .map(|(_, status)| status)
    }

    /// Block until any core of `set` has a completion for `client`
    ///
    /// # Returns
    /// The lowest such index and its status.
    pub fn wait_any(
        &self,
        client: &Client,
        set: CoreSet,
        timeout: Duration,
    ) -> Result<(usize, u32)> {
        let id = client.id();
        let first = set.iter().next().ok_or_else(|| {
            BrokerError::InvalidRequest(format!("empty {} set to wait on", self.kind))
        })?;
        if let Some(index) = set.iter().find(|&i| i >= self.len()) {
            return Err(BrokerError::CoreNotFound { core: self.core_id(index) });
        }

        // Ownership is re-checked on every wake: a core torn down from
        // under the waiter ends the wait instead of running to the deadline.
        let deadline = Instant::now() + timeout;
        let (index, status) = self
            .block_on(client, &self.done, Some(deadline), |state| {
                if let Some(lost) = set.iter().find(|&i| state.slots[i].owner != Some(id)) {
                    return Some(Err(lost));
                }
                let index = set.iter().find(|&i| state.slots[i].pending)?;
                let slot = &mut state.slots[index];
                slot.pending = false;
                Some(Ok((index, slot.irq_status)))
            })
            .map_err(|b| self.blocked_error(b, first))?
            .map_err(|lost| {
                BrokerError::InvalidRequest(format!(
                    "{} waits on {} it does not hold",
                    id,
                    self.core_id(lost)
                ))
            })?;

        self.stats.irq_delivered.fetch_add(1, Ordering::Relaxed);
        debug!("{} completed with status {:#x}", self.core_id(index), status);
        Ok((index, status))
    }

    /// Force-release everything `client` holds in this list
    ///
    /// Runs the same abort, mask restore and power-down steps as an
    /// explicit release. Cache units are also reset.
    ///
    /// # Returns
    /// Number of cores freed (the post-processor counts as one).
    pub fn release_client(&self, client: ClientId) -> usize {
        let mut freed = Vec::new();
        let mut pp_freed = false;
        {
            let mut state = self.lock();
            for index in 0..self.cores.len() {
                if state.slots[index].owner != Some(client) {
                    continue;
                }
                let core = &self.cores[index];
                match core.id.kind {
                    CoreKind::Cache => core.reset(),
                    _ => {
                        core.abort_if_running();
                    }
                }
                freed.push((index, self.free_slot(&mut state, index)));
            }
            if state.pp_owner == Some(client) {
                if let Some(core) = self.cores.first() {
                    Self::stop_pp(core);
                }
                state.pp_owner = None;
                pp_freed = true;
            }
        }

        let count = freed.len() + usize::from(pp_freed);
        if count == 0 {
            return 0;
        }
        self.notify_released();
        for (index, epoch) in freed {
            self.power_down(index, epoch);
        }
        info!("released {} {} reservation(s) left by {}", count, self.kind, client);
        count
    }

    /// Wake every blocked caller so it re-checks cancellation
    pub(crate) fn wake_all(&self) {
        let _state = self.lock();
        self.free.notify_all();
        self.done.notify_all();
    }

    /// Fail every current and future blocked caller
    pub(crate) fn detach(&self) {
        let mut state = self.lock();
        state.detached = true;
        self.free.notify_all();
        self.done.notify_all();
    }

    /// Drive every core's gate, regardless of reservations
    pub(crate) fn set_powered(&self, on: bool) {
        let control = self.policy.control.as_ref();
        for core in &self.cores {
            if on {
                core.gate.activate(core.id, control, self.policy.settle);
            } else {
                core.gate.deactivate(core.id, control, self.policy.settle);
            }
        }
    }

    pub fn status(&self) -> Vec<CoreStatus> {
        let slots: Vec<_> = self
            .lock()
            .slots
            .iter()
            .map(|s| (s.formats, s.owner, s.pending, s.irq_status))
            .collect();

        // Gate locks are taken only after the list lock is dropped
        self.cores
            .iter()
            .zip(slots)
            .map(|(core, (current, owner, pending, irq_status))| CoreStatus {
                id: core.id,
                base: core.base,
                generation: core.generation,
                formats: core.formats,
                current,
                owner,
                pending,
                irq_status,
                powered: core.gate.is_enabled(),
                reservations: core.perf.reservations(),
                busy: core.perf.busy_time(),
            })
            .collect()
    }
}
