//! Simulated hardware - Register banks for host tests and the CLI tool
//!
//! A [`SimRegisters`] bank behaves like a core's register file, including
//! write-one-to-clear status bits. [`SimBus`] plays the role of the
//! physical address space: banks are installed at a base address and
//! attach maps windows of them through the usual [`RegionMapper`] path.
//! [`SimCore`] fills a bank with the ID and synthesis configuration a
//! given generation reports.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::format::Formats;
use crate::mmio::{RegionMapper, ReservationTable};
use crate::probe::{
    format_fields, Generation, AUX_CORE_OFFSET, CACHE_ONLY_OFFSET, CACHE_READ_IRQ_MASK,
    CACHE_READ_STATUS_REG, CACHE_WITH_SHAPER_OFFSET, CACHE_WRITE_STATUS_REG, DEC_STATUS_REG,
    DEC_SYNTH_CFG_2, ENC_STATUS_REG, ID_REG, PIPELINE_FIELDS, SHAPER_OFFSET, W1C_MAJOR,
};
use crate::regs::RegisterIo;
use crate::Result;

/// Size of a simulated core bank; covers a main core and its aux window
pub const SIM_BANK_SIZE: usize = 0x1000;

/// In-memory register file
#[derive(Debug)]
pub struct SimRegisters {
    words: Vec<AtomicU32>,
    w1c: Vec<(usize, u32)>,
    writes: AtomicU64,
    /// Offset in the high half, value in the low half
    last_write: AtomicU64,
}

impl SimRegisters {
    pub fn new(size: usize) -> Self {
        Self {
            words: (0..size / 4).map(|_| AtomicU32::new(0)).collect(),
            w1c: Vec::new(),
            writes: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
        }
    }

    /// Make `mask` bits of the register at `offset` write-one-to-clear
    pub fn with_w1c(mut self, offset: usize, mask: u32) -> Self {
        self.w1c.push((offset, mask));
        self
    }

    /// Hardware-side store, bypassing clear semantics
    pub fn set(&self, offset: usize, value: u32) {
        if let Some(word) = self.words.get(offset / 4) {
            word.store(value, Ordering::SeqCst);
        }
    }

    /// Hardware-side OR, e.g. raising interrupt bits
    pub fn raise(&self, offset: usize, bits: u32) {
        if let Some(word) = self.words.get(offset / 4) {
            word.fetch_or(bits, Ordering::SeqCst);
        }
    }

    pub fn get(&self, offset: usize) -> u32 {
        self.words
            .get(offset / 4)
            .map_or(0, |word| word.load(Ordering::SeqCst))
    }

    /// Number of writes made through [`RegisterIo`]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Offset and value of the most recent [`RegisterIo`] write
    pub fn last_write(&self) -> Option<(usize, u32)> {
        if self.writes() == 0 {
            return None;
        }
        let packed = self.last_write.load(Ordering::SeqCst);
        Some(((packed >> 32) as usize, packed as u32))
    }

    fn w1c_mask(&self, offset: usize) -> u32 {
        self.w1c
            .iter()
            .filter(|&&(o, _)| o == offset)
            .fold(0, |acc, &(_, mask)| acc | mask)
    }
}

impl RegisterIo for SimRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.last_write
            .store(((offset as u64) << 32) | u64::from(value), Ordering::SeqCst);
        let Some(word) = self.words.get(offset / 4) else {
            return;
        };
        let mask = self.w1c_mask(offset);
        let old = word.load(Ordering::SeqCst);
        word.store((value & !mask) | (old & mask & !value), Ordering::SeqCst);
    }

    fn size(&self) -> usize {
        self.words.len() * 4
    }
}

/// A mapped view into part of a bank
#[derive(Debug)]
pub struct SimWindow {
    bank: Arc<SimRegisters>,
    offset: usize,
    size: usize,
}

impl RegisterIo for SimWindow {
    fn read32(&self, offset: usize) -> u32 {
        if offset + 4 > self.size {
            return 0;
        }
        self.bank.read32(self.offset + offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        if offset + 4 <= self.size {
            self.bank.write32(self.offset + offset, value);
        }
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// Simulated physical address space
#[derive(Debug, Default)]
pub struct SimBus {
    banks: RwLock<Vec<(u64, Arc<SimRegisters>)>>,
    claims: ReservationTable,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a bank at physical `base`
    pub fn install(&self, base: u64, bank: Arc<SimRegisters>) {
        self.banks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((base, bank));
    }

    /// Bank installed exactly at `base`
    pub fn bank(&self, base: u64) -> Option<Arc<SimRegisters>> {
        self.banks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(b, _)| *b == base)
            .map(|(_, bank)| Arc::clone(bank))
    }

    /// Windows currently mapped
    pub fn mapped(&self) -> usize {
        self.claims.len()
    }
}

impl RegionMapper for SimBus {
    fn map(&self, base: u64, size: usize) -> Result<Arc<dyn RegisterIo>> {
        self.claims.claim(base, size)?;

        let banks = self.banks.read().unwrap_or_else(PoisonError::into_inner);
        let hit = banks.iter().find(|(b, bank)| {
            base >= *b && base + size as u64 <= *b + bank.size() as u64
        });
        let window = match hit {
            Some((b, bank)) => SimWindow {
                bank: Arc::clone(bank),
                offset: (base - b) as usize,
                size,
            },
            // Nothing decodes here: reads as all zero
            None => SimWindow {
                bank: Arc::new(SimRegisters::new(size)),
                offset: 0,
                size,
            },
        };
        Ok(Arc::new(window))
    }

    fn unmap(&self, base: u64, size: usize) {
        self.claims.release(base, size);
    }
}

/// Register contents of one simulated core
#[derive(Debug, Clone, Copy)]
pub struct SimCore {
    generation: Generation,
    major: u8,
    formats: Formats,
    pipeline: Formats,
    cache_config: u32,
}

impl SimCore {
    /// Decoder of `generation`, major version 0x10 (write-back clear)
    pub fn decoder(generation: Generation) -> Self {
        Self {
            generation,
            major: 0x10,
            formats: Formats::empty(),
            pipeline: Formats::empty(),
            cache_config: 0,
        }
    }

    /// Encoder of `generation`, major version 0x62 (write-one-to-clear)
    pub fn encoder(generation: Generation) -> Self {
        Self {
            major: 0x62,
            ..Self::decoder(generation)
        }
    }

    /// Cache/shaper unit with ID configuration field `config`
    pub fn cache(config: u32) -> Self {
        Self {
            cache_config: config,
            ..Self::decoder(Generation::Cache)
        }
    }

    pub fn major(mut self, major: u8) -> Self {
        self.major = major;
        self
    }

    pub fn formats(mut self, formats: Formats) -> Self {
        self.formats = formats;
        self
    }

    /// Formats a VC8000D main core pipelines to its aux core
    pub fn pipeline(mut self, formats: Formats) -> Self {
        self.pipeline = formats;
        self
    }

    fn id(&self) -> u32 {
        match self.generation {
            Generation::Cache => (self.cache_config & 0xf) << 16 | 0x0100,
            generation => {
                (u32::from(generation.product()) << 16) | (u32::from(self.major) << 8)
            }
        }
    }

    /// Build the bank; install it on a [`SimBus`] at the node base
    pub fn build(&self) -> Arc<SimRegisters> {
        let mut bank = SimRegisters::new(SIM_BANK_SIZE);

        match self.generation {
            Generation::Cache => {
                for window in [0, CACHE_ONLY_OFFSET, CACHE_WITH_SHAPER_OFFSET] {
                    bank = bank.with_w1c(window as usize + CACHE_READ_STATUS_REG, CACHE_READ_IRQ_MASK);
                }
                for window in [0, SHAPER_OFFSET] {
                    bank = bank.with_w1c(window as usize + CACHE_WRITE_STATUS_REG, u32::MAX);
                }
            }
            Generation::H1 | Generation::Vc8000e if self.major >= W1C_MAJOR => {
                bank = bank.with_w1c(ENC_STATUS_REG, 0x1ff);
            }
            Generation::G1 | Generation::G2 | Generation::Vc8000d if self.major >= W1C_MAJOR => {
                for window in [0, AUX_CORE_OFFSET as usize] {
                    bank = bank.with_w1c(window + DEC_STATUS_REG, 0xff00);
                }
            }
            _ => {}
        }

        bank.set(ID_REG, self.id());
        for field in format_fields(self.generation) {
            if self.formats.intersects(field.formats) {
                bank.raise(field.reg, 1 << field.shift);
            }
        }
        if self.generation == Generation::Vc8000d {
            for field in PIPELINE_FIELDS {
                if self.pipeline.intersects(field.formats) {
                    bank.raise(DEC_SYNTH_CFG_2, 1 << field.shift);
                }
            }
            bank.set(AUX_CORE_OFFSET as usize + ID_REG, self.id());
        }
        Arc::new(bank)
    }
}
