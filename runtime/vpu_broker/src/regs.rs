//! Register I/O - 32-bit access to a core's register window
//!
//! The broker only ever touches a handful of registers per core (ID,
//! synthesis configuration, interrupt status and the enable/abort bits);
//! everything else a job needs is pushed by the client through the same
//! window. [`RegisterIo`] is the seam between the arbiter and whatever
//! backs the window: real MMIO on hardware, [`crate::sim`] banks on a host.

/// Word-granular access to one mapped register window
///
/// Offsets are in bytes and must be 4-byte aligned.
pub trait RegisterIo: Send + Sync {
    /// Read the 32-bit register at `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Write the 32-bit register at `offset`
    fn write32(&self, offset: usize, value: u32);

    /// Window size in bytes
    fn size(&self) -> usize;
}

/// MMIO register accessor
///
/// Volatile accessor over a window that is already mapped into this
/// address space.
#[derive(Debug)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// Create a new MMIO region
    ///
    /// # Safety
    /// `base..base + size` must be mapped device memory (or otherwise valid
    /// memory) for the whole lifetime of the region, and must not be
    /// reclaimed while any clone of the owning `Arc` is alive.
    pub unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Get base address
    pub fn base(&self) -> usize {
        self.base
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size);
        debug_assert!(offset % 4 == 0);
        // SAFETY: the constructor contract keeps the window mapped and the
        // debug assertions keep the access inside it.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size);
        debug_assert!(offset % 4 == 0);
        // SAFETY: see read32.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn size(&self) -> usize {
        self.size
    }
}
