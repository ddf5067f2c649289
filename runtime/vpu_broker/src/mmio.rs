//! MMIO Mapping - Register window claims and translation
//!
//! Cores are attached from physical base addresses. A [`RegionMapper`]
//! claims the window exclusively (two cores may never share registers) and
//! hands back a [`RegisterIo`] for it. [`LinearMapper`] serves windows out
//! of a device arena that the platform already mapped uncached;
//! [`crate::sim::SimBus`] serves them from simulated banks.

use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::regs::{MmioRegion, RegisterIo};
use crate::{BrokerError, Result};

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Source of register windows for attach
pub trait RegionMapper: Send + Sync {
    /// Claim and map `size` bytes of registers at physical `base`
    ///
    /// # Errors
    /// `RegionBusy` if any byte of the window is already claimed.
    fn map(&self, base: u64, size: usize) -> Result<Arc<dyn RegisterIo>>;

    /// Give back a window obtained from [`RegionMapper::map`]
    fn unmap(&self, base: u64, size: usize);
}

/// Exclusive claims on physical register windows
#[derive(Debug, Default)]
pub struct ReservationTable {
    claims: Mutex<Vec<(u64, usize)>>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `base..base + size`
    ///
    /// # Errors
    /// `RegionBusy` when the window overlaps an existing claim,
    /// `InvalidRequest` when it runs past the end of the address space.
    pub fn claim(&self, base: u64, size: usize) -> Result<()> {
        let end = window_end(base, size)?;
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let overlaps = claims
            .iter()
            .any(|&(b, s)| base < b + s as u64 && b < end);
        if overlaps {
            return Err(BrokerError::RegionBusy { base, size });
        }
        claims.push((base, size));
        Ok(())
    }

    /// Drop a claim; returns false if it was not held
    pub fn release(&self, base: u64, size: usize) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.iter().position(|&c| c == (base, size)) {
            Some(pos) => {
                claims.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of windows currently claimed
    pub fn len(&self) -> usize {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps windows from a linearly mapped device arena
///
/// The platform maps physical `phys_base..phys_base + size` at `virt_base`
/// once; windows are page-granular views into that arena.
#[derive(Debug)]
pub struct LinearMapper {
    phys_base: u64,
    virt_base: usize,
    size: usize,
    claims: ReservationTable,
}

impl LinearMapper {
    /// Create a mapper over an already mapped arena
    ///
    /// # Safety
    /// `virt_base..virt_base + size` must stay mapped to the device arena
    /// for as long as any window handed out by this mapper is alive.
    pub unsafe fn new(phys_base: u64, virt_base: usize, size: usize) -> Self {
        Self {
            phys_base,
            virt_base,
            size,
            claims: ReservationTable::new(),
        }
    }

    /// Windows currently handed out
    pub fn mapped(&self) -> usize {
        self.claims.len()
    }
}

impl RegionMapper for LinearMapper {
    fn map(&self, base: u64, size: usize) -> Result<Arc<dyn RegisterIo>> {
        let offset = base
            .checked_sub(self.phys_base)
            .and_then(|o| usize::try_from(o).ok())
            .ok_or_else(|| {
                BrokerError::InvalidRequest(format!("window {base:#x} below device arena"))
            })?;

        // Mappings are page granular, so the whole page span must fit.
        let span_start = align_down(offset);
        let span_end = offset
            .checked_add(size)
            .and_then(|end| end.checked_add(PAGE_SIZE - 1))
            .map(align_down);
        let Some(span_end) = span_end.filter(|&end| end <= self.size) else {
            return Err(BrokerError::InvalidRequest(format!(
                "window {base:#x}+{size:#x} outside device arena"
            )));
        };

        self.claims.claim(base, size)?;
        let vaddr = self.virt_base + offset;
        debug!(
            "mapped {:#x}+{:#x} at {:#x} ({} pages)",
            base,
            size,
            vaddr,
            pages_needed(span_end - span_start)
        );

        // SAFETY: the window lies inside the arena the constructor contract
        // keeps mapped.
        let region = unsafe { MmioRegion::new(vaddr, size) };
        Ok(Arc::new(region))
    }

    fn unmap(&self, base: u64, size: usize) {
        if !self.claims.release(base, size) {
            debug!("unmap of unclaimed window {:#x}+{:#x}", base, size);
        }
    }
}

/// Exclusive end of `base..base + size`
///
/// # Errors
/// `InvalidRequest` if the window wraps the physical address space.
pub fn window_end(base: u64, size: usize) -> Result<u64> {
    u64::try_from(size)
        .ok()
        .and_then(|size| base.checked_add(size))
        .ok_or_else(|| BrokerError::InvalidRequest(format!("window {base:#x}+{size:#x} wraps")))
}

/// Helper to calculate number of pages needed
pub fn pages_needed(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Helper to align address down to page boundary
pub fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Helper to align address up to page boundary
pub fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
