//! Interrupt Completion Bridge - From status registers to woken waiters
//!
//! Lines may be shared by every core of a family, so a line fires the
//! handler of each family registered on it and the handler scans all of
//! that family's cores. A core whose status shows a completion is cleared
//! in hardware under the list lock. If someone owns it the status is recorded
//! as pending and the family's completion waiters are woken; otherwise it
//! is a zombie and only the hardware clear happens.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::AddAssign;
use std::sync::atomic::Ordering;
use std::sync::{PoisonError, RwLock};

use log::{debug, warn};

use crate::arbiter::CoreList;
use crate::registry::{CoreId, CoreKind, DeviceId};
use crate::{BrokerError, Result};

/// What one handler run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqOutcome {
    /// Completions recorded for an owner
    pub delivered: usize,
    /// Completions cleared on cores nobody owns
    pub zombies: usize,
}

impl IrqOutcome {
    /// Whether any core on the line had raised the interrupt
    pub fn handled(&self) -> bool {
        self.delivered + self.zombies > 0
    }
}

impl AddAssign for IrqOutcome {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.zombies += other.zombies;
    }
}

impl CoreList {
    /// Top half: scan every core of the list for a completion
    ///
    /// Never blocks beyond the list's short ownership lock, taken once per
    /// core around the status read, the hardware clear and the record.
    pub fn handle_irq(&self) -> IrqOutcome {
        let mut outcome = IrqOutcome::default();

        for (index, core) in self.cores.iter().enumerate() {
            // Ownership must not change between the ack and the record.
            let (status, owned) = {
                let mut state = self.lock();
                let Some(status) = core.ack_interrupt() else {
                    continue;
                };
                let slot = &mut state.slots[index];
                let owned = slot.owner.is_some();
                if owned {
                    slot.pending = true;
                    slot.irq_status = status;
                }
                (status, owned)
            };
            self.stats.irq_received.fetch_add(1, Ordering::Relaxed);

            if owned {
                outcome.delivered += 1;
                debug!("{} interrupt, status {:#x}", core.id, status);
            } else {
                outcome.zombies += 1;
                warn!("zombie interrupt on {} (status {:#x}) cleared", core.id, status);
            }
        }

        if outcome.delivered > 0 {
            self.done.notify_all();
        }
        outcome
    }
}

/// Interrupt line registrations of every attached core
#[derive(Debug, Default)]
pub struct IrqTable {
    lines: RwLock<BTreeMap<u32, Vec<CoreId>>>,
    masked: RwLock<BTreeSet<u32>>,
}

impl IrqTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `core` as a source on `line`; lines may be shared
    ///
    /// # Errors
    /// `IrqAlreadyRegistered` if this core already sits on the line.
    pub fn register(&self, line: u32, core: CoreId) -> Result<()> {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        let sources = lines.entry(line).or_default();
        if sources.contains(&core) {
            return Err(BrokerError::IrqAlreadyRegistered { line });
        }
        sources.push(core);
        Ok(())
    }

    /// Drop every registration of `device`; returns how many were removed
    pub fn unregister_device(&self, device: DeviceId) -> usize {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        lines.retain(|_, sources| {
            let before = sources.len();
            sources.retain(|core| core.device != device);
            removed += before - sources.len();
            !sources.is_empty()
        });
        removed
    }

    pub fn sources(&self, line: u32) -> Vec<CoreId> {
        self.lines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&line)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_registered(&self, line: u32) -> bool {
        self.lines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&line)
    }

    /// Lines a core is registered on
    pub fn lines_of(&self, core: CoreId) -> Vec<u32> {
        self.lines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, sources)| sources.contains(&core))
            .map(|(&line, _)| line)
            .collect()
    }

    pub fn mask(&self, line: u32) {
        self.masked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(line);
    }

    pub fn unmask(&self, line: u32) {
        self.masked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&line);
    }

    pub fn is_masked(&self, line: u32) -> bool {
        self.masked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&line)
    }

    /// Device families whose handler runs for `line`
    ///
    /// Empty while the line is masked.
    pub fn targets(&self, line: u32) -> Vec<(DeviceId, CoreKind)> {
        if self.is_masked(line) {
            return Vec::new();
        }
        let mut targets: Vec<_> = self
            .sources(line)
            .into_iter()
            .map(|core| (core.device, core.kind))
            .collect();
        targets.dedup();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(device: u32, kind: CoreKind, index: usize) -> CoreId {
        CoreId::new(DeviceId(device), kind, index)
    }

    #[test]
    fn test_shared_line_registration() {
        let table = IrqTable::new();
        table.register(40, core(0, CoreKind::Decoder, 0)).unwrap();
        table.register(40, core(0, CoreKind::Decoder, 1)).unwrap();
        table.register(41, core(0, CoreKind::Encoder, 0)).unwrap();

        let result = table.register(40, core(0, CoreKind::Decoder, 1));
        assert!(matches!(result, Err(BrokerError::IrqAlreadyRegistered { line: 40 })));

        assert_eq!(table.sources(40).len(), 2);
        assert_eq!(table.targets(40), vec![(DeviceId(0), CoreKind::Decoder)]);
        assert_eq!(table.lines_of(core(0, CoreKind::Encoder, 0)), vec![41]);
    }

    #[test]
    fn test_masked_line_has_no_targets() {
        let table = IrqTable::new();
        table.register(7, core(1, CoreKind::Cache, 0)).unwrap();

        table.mask(7);
        assert!(table.is_masked(7));
        assert!(table.targets(7).is_empty());

        table.unmask(7);
        assert_eq!(table.targets(7), vec![(DeviceId(1), CoreKind::Cache)]);
    }

    #[test]
    fn test_unregister_device() {
        let table = IrqTable::new();
        table.register(3, core(0, CoreKind::Decoder, 0)).unwrap();
        table.register(3, core(1, CoreKind::Decoder, 0)).unwrap();
        table.register(4, core(1, CoreKind::Encoder, 0)).unwrap();

        assert_eq!(table.unregister_device(DeviceId(1)), 2);
        assert!(table.is_registered(3));
        assert!(!table.is_registered(4));
    }

    #[test]
    fn test_outcome_accumulates() {
        let mut total = IrqOutcome::default();
        assert!(!total.handled());
        total += IrqOutcome { delivered: 1, zombies: 0 };
        total += IrqOutcome { delivered: 0, zombies: 2 };
        assert_eq!(total, IrqOutcome { delivered: 1, zombies: 2 });
        assert!(total.handled());
    }
}
