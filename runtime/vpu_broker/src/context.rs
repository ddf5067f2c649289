//! Broker context - Owner of every attached device
//!
//! Replaces process-wide device pointers: each entry point goes through a
//! [`Context`], so several independent broker instances can coexist and
//! teardown order is explicit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};

use crate::client::{Client, ClientId};
use crate::config::BrokerConfig;
use crate::device::{AttachEnv, Device, DeviceDescriptor};
use crate::irq::{IrqOutcome, IrqTable};
use crate::mmio::RegionMapper;
use crate::power::PowerControl;
use crate::probe::{CapabilityProbe, HantroProbe};
use crate::registry::{CoreId, CoreKind, DeviceId, MAX_DEVICES};
use crate::{BrokerError, Result};

/// One entry of the device table
#[derive(Default)]
enum DeviceSlot {
    #[default]
    Free,
    /// Taken by an attach that is still probing and powering cores
    Attaching,
    Attached(Arc<Device>),
}

impl DeviceSlot {
    fn device(&self) -> Option<&Arc<Device>> {
        match self {
            DeviceSlot::Attached(device) => Some(device),
            _ => None,
        }
    }

    fn take_attached(&mut self) -> Option<Arc<Device>> {
        match std::mem::take(self) {
            DeviceSlot::Attached(device) => Some(device),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Attached devices, the interrupt line table and client bookkeeping
pub struct Context {
    config: BrokerConfig,
    mapper: Arc<dyn RegionMapper>,
    probe: Arc<dyn CapabilityProbe>,
    power: Arc<dyn PowerControl>,
    devices: RwLock<Vec<DeviceSlot>>,
    irqs: IrqTable,
    next_client: AtomicU64,
}

impl Context {
    /// Context using the Hantro decode tables
    pub fn new(
        config: BrokerConfig,
        mapper: Arc<dyn RegionMapper>,
        power: Arc<dyn PowerControl>,
    ) -> Self {
        Self::with_probe(config, mapper, power, Arc::new(HantroProbe))
    }

    pub fn with_probe(
        config: BrokerConfig,
        mapper: Arc<dyn RegionMapper>,
        power: Arc<dyn PowerControl>,
        probe: Arc<dyn CapabilityProbe>,
    ) -> Self {
        Self {
            config,
            mapper,
            probe,
            power,
            devices: RwLock::new(Vec::new()),
            irqs: IrqTable::new(),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn irqs(&self) -> &IrqTable {
        &self.irqs
    }

    /// Register a new client identity
    pub fn open(&self) -> Arc<Client> {
        let id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        debug!("{} opened", id);
        Arc::new(Client::new(id))
    }

    /// Probe and attach a device
    ///
    /// The device table is only locked to take a slot and to publish the
    /// result. Probing and power sequencing run outside it.
    ///
    /// # Returns
    /// The id the device is reachable under until [`Context::detach`].
    ///
    /// # Errors
    /// `DeviceNotFound` if no node of the descriptor yields a usable core,
    /// `NoDeviceSlot` once [`MAX_DEVICES`] devices are attached.
    pub fn attach(&self, descriptor: &DeviceDescriptor) -> Result<DeviceId> {
        let id = self.take_slot()?;
        let result = self.build_device(id, descriptor);

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let slot = &mut devices[id.0 as usize];
        match result {
            Ok(device) => {
                *slot = DeviceSlot::Attached(device);
                Ok(id)
            }
            Err(e) => {
                *slot = DeviceSlot::Free;
                Err(e)
            }
        }
    }

    fn take_slot(&self) -> Result<DeviceId> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let index = match devices.iter().position(|s| matches!(s, DeviceSlot::Free)) {
            Some(index) => index,
            None if devices.len() < MAX_DEVICES => {
                devices.push(DeviceSlot::Free);
                devices.len() - 1
            }
            None => return Err(BrokerError::NoDeviceSlot { max: MAX_DEVICES }),
        };
        devices[index] = DeviceSlot::Attaching;
        Ok(DeviceId(index as u32))
    }

    fn build_device(&self, id: DeviceId, descriptor: &DeviceDescriptor) -> Result<Arc<Device>> {
        let env = AttachEnv {
            config: &self.config,
            mapper: Arc::clone(&self.mapper),
            probe: self.probe.as_ref(),
            control: Arc::clone(&self.power),
        };
        let device = Arc::new(Device::attach(id, descriptor, env)?);

        if self.config.irq_mode {
            for list in device.lists() {
                for core in list.cores() {
                    for &line in core.irq_lines() {
                        if let Err(e) = self.irqs.register(line, core.id()) {
                            self.irqs.unregister_device(id);
                            device.detach();
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(device)
    }

    /// Tear a device down
    ///
    /// Callers blocked on it wake up and fail with `DeviceNotFound`.
    pub fn detach(&self, id: DeviceId) -> Result<()> {
        let device = {
            let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
            devices
                .get_mut(id.0 as usize)
                .and_then(DeviceSlot::take_attached)
                .ok_or(BrokerError::DeviceNotFound { device: id })?
        };
        let lines = self.irqs.unregister_device(id);
        debug!("{} dropped {} IRQ registration(s)", id, lines);
        device.detach();
        Ok(())
    }

    /// Look up an attached device
    ///
    /// # Errors
    /// `DeviceNotFound` for an unknown or detached id.
    pub fn device(&self, id: DeviceId) -> Result<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0 as usize)
            .and_then(DeviceSlot::device)
            .cloned()
            .ok_or(BrokerError::DeviceNotFound { device: id })
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(DeviceSlot::device)
            .cloned()
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices().len()
    }

    pub fn core_count(&self, device: DeviceId, kind: CoreKind) -> Result<usize> {
        Ok(self.device(device)?.core_count(kind))
    }

    pub fn core_offset(&self, core: CoreId) -> Result<(u64, usize)> {
        self.device(core.device)?.core_offset(core)
    }

    /// Client teardown: force-release everything it still holds
    ///
    /// # Returns
    /// Number of reservations freed across all devices.
    pub fn close(&self, client: &Client) -> usize {
        let freed: usize = self
            .devices()
            .iter()
            .map(|device| device.release_client(client.id()))
            .sum();
        if freed > 0 {
            info!("{} closed with {} reservation(s) outstanding", client.id(), freed);
        }
        freed
    }

    /// Cancel whatever `client` is blocked in
    ///
    /// The flag is consumed by the next blocking call that would sleep.
    pub fn interrupt(&self, client: &Client) {
        client.raise_interrupt();
        for device in self.devices() {
            device.wake_all();
        }
    }

    /// Interrupt entry point for one line
    ///
    /// Runs the handler of every device family registered on the line.
    pub fn dispatch_irq(&self, line: u32) -> IrqOutcome {
        let mut outcome = IrqOutcome::default();
        for (device, kind) in self.irqs.targets(line) {
            if let Ok(device) = self.device(device) {
                outcome += device.handle_irq(kind);
            }
        }
        if !outcome.handled() {
            debug!("IRQ {} not handled", line);
        }
        outcome
    }

    /// Mask every line `core` is registered on
    pub fn mask_core_irqs(&self, core: CoreId) -> Result<()> {
        self.device(core.device)?.core(core)?;
        let lines = self.irqs.lines_of(core);
        if lines.is_empty() {
            warn!("{} has no IRQ line to mask", core);
        }
        for line in lines {
            self.irqs.mask(line);
        }
        Ok(())
    }

    pub fn unmask_core_irqs(&self, core: CoreId) -> Result<()> {
        self.device(core.device)?.core(core)?;
        for line in self.irqs.lines_of(core) {
            self.irqs.unmask(line);
        }
        Ok(())
    }
}
