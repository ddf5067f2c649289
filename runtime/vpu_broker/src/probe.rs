//! Capability Prober - Hardware ID and synthesis configuration decode
//!
//! Every core starts with an ID register whose upper half names the
//! product. The product selects a decode table that turns the synthesis
//! configuration registers into a [`Formats`] mask, and an interrupt scheme
//! telling the bridge which status bits mean "done" and how to clear them.
//! Nothing here writes to hardware.

use core::fmt;

use log::info;
use serde::{Deserialize, Serialize};

use crate::device::CacheDir;
use crate::format::Formats;
use crate::regs::RegisterIo;
use crate::registry::CoreKind;
use crate::{BrokerError, Result};

/// Hardware ID register, all families
pub const ID_REG: usize = 0x00;

/// Decoder interrupt status / control register
pub const DEC_STATUS_REG: usize = 0x04;
pub const DEC_SYNTH_CFG: usize = 50 * 4;
pub const DEC_SYNTH_CFG_2: usize = 54 * 4;
pub const DEC_SYNTH_CFG_3: usize = 56 * 4;
pub const DEC_G2_CFG: usize = 58 * 4;
pub const DEC_PP_CFG: usize = 59 * 4;
/// Post-processor status register (hosted on decoder core 0)
pub const PP_STATUS_REG: usize = 60 * 4;
pub const G1_PP_SYNTH_CFG: usize = 100 * 4;

pub const DEC_E: u32 = 0x01;
pub const DEC_IRQ_DISABLE: u32 = 0x10;
pub const DEC_ABORT: u32 = 0x20;
pub const DEC_IRQ: u32 = 0x100;
pub const PP_E: u32 = 0x01;
pub const PP_IRQ_DISABLE: u32 = 0x10;

pub const ENC_STATUS_REG: usize = 0x04;
pub const ENC_CONTROL_REG: usize = 0x14;
pub const ENC_SYNTH_CFG: usize = 80 * 4;
pub const ENC_IRQ: u32 = 0x01;
pub const ENC_E: u32 = 0x01;
pub const ENC_BUFFER_FULL: u32 = 0x20;
/// Status bits an older encoder clears itself when written back as zero
pub const ENC_LEGACY_CLEAR_MASK: u32 = 0x1fd;

pub const CACHE_READ_STATUS_REG: usize = 0x04;
pub const CACHE_WRITE_STATUS_REG: usize = 0x0c;
pub const CACHE_READ_IRQ_MASK: u32 = 0x28;
pub const CACHE_ONLY_OFFSET: u64 = 0x40;
pub const CACHE_WITH_SHAPER_OFFSET: u64 = 0x80;
pub const SHAPER_OFFSET: u64 = 0x200;

/// Offset of a VC8000D auxiliary core from its main core
pub const AUX_CORE_OFFSET: u64 = 0x800;

/// First major version whose interrupt status is write-one-to-clear
pub const W1C_MAJOR: u8 = 0x61;

/// Raw value of a core's ID register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwId(pub u32);

impl HwId {
    pub fn product(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn major(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn minor(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Cache/shaper configuration field
    pub fn cache_config(self) -> u32 {
        (self.0 >> 16) & 0xf
    }
}

impl fmt::Display for HwId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Hardware generation, selected by product ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    G1,
    G2,
    Vc8000d,
    H1,
    Vc8000e,
    Cache,
}

impl Generation {
    pub(crate) fn from_product(kind: CoreKind, product: u16) -> Option<Self> {
        match (kind, product) {
            (CoreKind::Decoder, 0x6731) => Some(Generation::G1),
            (CoreKind::Decoder, 0x6732) => Some(Generation::G2),
            (CoreKind::Decoder, 0x8001) => Some(Generation::Vc8000d),
            (CoreKind::Encoder, 0x4831) => Some(Generation::H1),
            (CoreKind::Encoder, 0x8000) => Some(Generation::Vc8000e),
            _ => None,
        }
    }

    /// Product ID the generation reports in its ID register
    pub fn product(self) -> u16 {
        match self {
            Generation::G1 => 0x6731,
            Generation::G2 => 0x6732,
            Generation::Vc8000d => 0x8001,
            Generation::H1 => 0x4831,
            Generation::Vc8000e => 0x8000,
            Generation::Cache => 0,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Generation::G1 => "G1",
            Generation::G2 => "G2",
            Generation::Vc8000d => "VC8000D",
            Generation::H1 => "H1",
            Generation::Vc8000e => "VC8000E",
            Generation::Cache => "cache",
        };
        f.write_str(name)
    }
}

/// One synthesis configuration field and the formats it enables
#[derive(Debug, Clone, Copy)]
pub(crate) struct Field {
    pub reg: usize,
    pub shift: u32,
    pub mask: u32,
    pub formats: Formats,
}

const fn field(reg: usize, shift: u32, mask: u32, formats: Formats) -> Field {
    Field { reg, shift, mask, formats }
}

const G1_FIELDS: &[Field] = &[
    field(DEC_SYNTH_CFG, 0, 0x3, Formats::H264),
    field(DEC_SYNTH_CFG, 2, 0x3, Formats::MPEG4),
    field(DEC_SYNTH_CFG, 4, 0x1, Formats::JPEG),
    field(DEC_SYNTH_CFG, 5, 0x3, Formats::VC1),
    field(DEC_SYNTH_CFG, 7, 0x1, Formats::MPEG2),
    field(DEC_SYNTH_CFG, 8, 0x1, Formats::VP6),
    field(DEC_SYNTH_CFG_2, 0, 0x7, Formats::VP8),
    field(DEC_SYNTH_CFG_2, 3, 0x1, Formats::AVS),
    field(DEC_SYNTH_CFG_2, 4, 0x3, Formats::RV),
    field(G1_PP_SYNTH_CFG, 0, 0x1, Formats::PP),
];

const G2_FIELDS: &[Field] = &[
    field(DEC_G2_CFG, 0, 0x1, Formats::HEVC),
    field(DEC_G2_CFG, 1, 0x1, Formats::VP9),
    field(DEC_PP_CFG, 0, 0x1, Formats::PP),
];

const VC8000D_FIELDS: &[Field] = &[
    field(DEC_SYNTH_CFG, 0, 0x3, Formats::H264),
    field(DEC_SYNTH_CFG, 2, 0x3, Formats::MPEG4),
    field(DEC_SYNTH_CFG, 4, 0x1, Formats::JPEG),
    field(DEC_SYNTH_CFG, 5, 0x3, Formats::VC1),
    field(DEC_SYNTH_CFG, 7, 0x1, Formats::MPEG2),
    field(DEC_SYNTH_CFG, 8, 0x1, Formats::VP6),
    field(DEC_SYNTH_CFG, 9, 0x1, Formats::H264),
    field(DEC_SYNTH_CFG_2, 0, 0x7, Formats::VP8),
    field(DEC_SYNTH_CFG_2, 3, 0x1, Formats::AVS),
    field(DEC_SYNTH_CFG_2, 4, 0x3, Formats::RV),
    field(DEC_SYNTH_CFG_3, 0, 0x7, Formats::HEVC),
    field(DEC_SYNTH_CFG_3, 3, 0x7, Formats::VP9),
    field(DEC_PP_CFG, 0, 0x1, Formats::PP),
];

/// Pipelined formats a VC8000D main core can hand to its auxiliary core
pub(crate) const PIPELINE_FIELDS: &[Field] = &[
    field(DEC_SYNTH_CFG_2, 6, 0x1, Formats::H264),
    field(DEC_SYNTH_CFG_2, 7, 0x1, Formats::JPEG),
];

const H1_FIELDS: &[Field] = &[
    field(ENC_SYNTH_CFG, 0, 0x1, Formats::H264),
    field(ENC_SYNTH_CFG, 1, 0x1, Formats::JPEG),
    field(ENC_SYNTH_CFG, 2, 0x1, Formats::VP8),
];

const VC8000E_FIELDS: &[Field] = &[
    field(ENC_SYNTH_CFG, 0, 0x1, Formats::HEVC),
    field(ENC_SYNTH_CFG, 1, 0x1, Formats::H264),
    field(ENC_SYNTH_CFG, 2, 0x1, Formats::JPEG),
];

pub(crate) fn format_fields(generation: Generation) -> &'static [Field] {
    match generation {
        Generation::G1 => G1_FIELDS,
        Generation::G2 => G2_FIELDS,
        Generation::Vc8000d => VC8000D_FIELDS,
        Generation::H1 => H1_FIELDS,
        Generation::Vc8000e => VC8000E_FIELDS,
        Generation::Cache => &[],
    }
}

fn decode(fields: &[Field], regs: &dyn RegisterIo) -> Formats {
    fields
        .iter()
        .filter(|f| (regs.read32(f.reg) >> f.shift) & f.mask != 0)
        .fold(Formats::empty(), |acc, f| acc | f.formats)
}

/// How a completion interrupt is acknowledged in the status register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    /// Write the observed status back; set bits clear
    WriteOne,
    /// Write the status back with these bits zeroed
    WriteBackMasked(u32),
}

impl ClearMode {
    /// Pick the clear rule from the ID register's major version
    pub fn for_major(major: u8, legacy_mask: u32) -> Self {
        if major >= W1C_MAJOR {
            ClearMode::WriteOne
        } else {
            ClearMode::WriteBackMasked(legacy_mask)
        }
    }

    pub fn clear_value(self, status: u32) -> u32 {
        match self {
            ClearMode::WriteOne => status,
            ClearMode::WriteBackMasked(mask) => status & !mask,
        }
    }
}

/// How a running job is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortMethod {
    None,
    /// Running while `enable` is set in the status register; OR in `bits`
    StatusBits { enable: u32, bits: u32 },
    /// Running while `enable` is set at `offset`; write zero there
    ZeroControl { offset: usize, enable: u32 },
}

/// Interrupt handling rules of one core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqScheme {
    pub status_offset: usize,
    /// Any of these bits means the core finished a job
    pub done_mask: u32,
    pub clear: ClearMode,
    /// Bits removed from the status handed to the waiter
    pub report_strip: u32,
    /// Overflow bit and the control register zeroed before the clear
    pub overflow: Option<(u32, usize)>,
    pub abort: AbortMethod,
}

impl IrqScheme {
    pub fn decoder(hw_id: HwId) -> Self {
        Self {
            status_offset: DEC_STATUS_REG,
            done_mask: DEC_IRQ,
            clear: ClearMode::for_major(hw_id.major(), DEC_IRQ),
            report_strip: 0,
            overflow: None,
            abort: AbortMethod::StatusBits {
                enable: DEC_E,
                bits: DEC_ABORT | DEC_IRQ_DISABLE,
            },
        }
    }

    pub fn encoder(hw_id: HwId) -> Self {
        Self {
            status_offset: ENC_STATUS_REG,
            done_mask: ENC_IRQ,
            clear: ClearMode::for_major(hw_id.major(), ENC_LEGACY_CLEAR_MASK),
            report_strip: ENC_IRQ,
            overflow: Some((ENC_BUFFER_FULL, ENC_CONTROL_REG)),
            abort: AbortMethod::ZeroControl {
                offset: ENC_CONTROL_REG,
                enable: ENC_E,
            },
        }
    }

    pub fn cache(dir: CacheDir) -> Self {
        let (status_offset, done_mask) = match dir {
            CacheDir::Read => (CACHE_READ_STATUS_REG, CACHE_READ_IRQ_MASK),
            CacheDir::Write => (CACHE_WRITE_STATUS_REG, u32::MAX),
        };
        Self {
            status_offset,
            done_mask,
            clear: ClearMode::WriteOne,
            report_strip: 0,
            overflow: None,
            abort: AbortMethod::None,
        }
    }
}

/// Auxiliary core found behind a main core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxReport {
    /// Offset of the auxiliary window from the main core's base
    pub offset: u64,
    pub formats: Formats,
}

/// Result of probing one core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub hw_id: HwId,
    pub generation: Generation,
    pub formats: Formats,
    pub irq: IrqScheme,
    pub aux: Option<AuxReport>,
}

/// Turns a mapped register window into a capability report
pub trait CapabilityProbe: Send + Sync {
    /// Identify a decoder or encoder core
    ///
    /// # Errors
    /// `UnknownHardware` when the product ID matches no known generation.
    fn probe(&self, kind: CoreKind, base: u64, regs: &dyn RegisterIo) -> Result<ProbeReport>;

    /// Validate a cache/shaper unit from its ID and requested direction
    ///
    /// # Returns
    /// Offset of the direction's register window from the node base, and
    /// the unit's report.
    ///
    /// # Errors
    /// `InvalidCache` when the unit cannot serve the direction.
    fn probe_cache(&self, base: u64, id: u32, dir: CacheDir) -> Result<(u64, ProbeReport)>;
}

/// Decode tables for G1, G2, VC8000D, H1, VC8000E and the cache/shaper
#[derive(Debug, Clone, Copy, Default)]
pub struct HantroProbe;

impl CapabilityProbe for HantroProbe {
    fn probe(&self, kind: CoreKind, base: u64, regs: &dyn RegisterIo) -> Result<ProbeReport> {
        let hw_id = HwId(regs.read32(ID_REG));
        let generation = Generation::from_product(kind, hw_id.product())
            .ok_or(BrokerError::UnknownHardware { base, id: hw_id.0 })?;

        let formats = decode(format_fields(generation), regs);
        let aux = match generation {
            Generation::Vc8000d => {
                let pipelined = decode(PIPELINE_FIELDS, regs);
                (!pipelined.is_empty()).then_some(AuxReport {
                    offset: AUX_CORE_OFFSET,
                    formats: pipelined,
                })
            }
            _ => None,
        };
        let irq = match kind {
            CoreKind::Encoder => IrqScheme::encoder(hw_id),
            _ => IrqScheme::decoder(hw_id),
        };

        info!(
            "{} {} at {:#x} with ID {}: {}",
            generation, kind, base, hw_id, formats
        );
        Ok(ProbeReport {
            hw_id,
            generation,
            formats,
            irq,
            aux,
        })
    }

    fn probe_cache(&self, base: u64, id: u32, dir: CacheDir) -> Result<(u64, ProbeReport)> {
        let hw_id = HwId(id);
        let config = hw_id.cache_config();
        let invalid = BrokerError::InvalidCache { base, id };

        // 0: cache and shaper, 1: cache only, 2: shaper only
        let offset = match (config, dir) {
            (c, _) if c > 2 => return Err(invalid),
            (1, CacheDir::Write) | (2, CacheDir::Read) => return Err(invalid),
            (_, CacheDir::Write) if id == 0 => 0,
            (_, CacheDir::Write) => SHAPER_OFFSET,
            (1, CacheDir::Read) => CACHE_ONLY_OFFSET,
            (_, CacheDir::Read) => CACHE_WITH_SHAPER_OFFSET,
        };

        info!(
            "cache unit at {:#x} with ID {}: {:?} window at +{:#x}",
            base, hw_id, dir, offset
        );
        Ok((
            offset,
            ProbeReport {
                hw_id,
                generation: Generation::Cache,
                formats: Formats::empty(),
                irq: IrqScheme::cache(dir),
                aux: None,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRegisters;

    fn bank(id: u32, regs: &[(usize, u32)]) -> SimRegisters {
        let bank = SimRegisters::new(0x1000);
        bank.set(ID_REG, id);
        for &(offset, value) in regs {
            bank.set(offset, value);
        }
        bank
    }

    #[test]
    fn test_probe_vc8000d_with_pipeline() {
        let regs = bank(
            0x8001_1000,
            &[
                (DEC_SYNTH_CFG, 0x1 | 0x10),
                (DEC_SYNTH_CFG_2, 1 << 6 | 1 << 7),
                (DEC_SYNTH_CFG_3, 0x1 << 3),
            ],
        );
        let report = HantroProbe.probe(CoreKind::Decoder, 0x1000, &regs).unwrap();

        assert_eq!(report.generation, Generation::Vc8000d);
        assert_eq!(report.formats, Formats::H264 | Formats::JPEG | Formats::VP9);
        let aux = report.aux.unwrap();
        assert_eq!(aux.offset, AUX_CORE_OFFSET);
        assert_eq!(aux.formats, Formats::H264 | Formats::JPEG);
    }

    #[test]
    fn test_probe_g2_has_no_aux() {
        let regs = bank(0x6732_0100, &[(DEC_G2_CFG, 0x3), (DEC_SYNTH_CFG_2, 1 << 6)]);
        let report = HantroProbe.probe(CoreKind::Decoder, 0, &regs).unwrap();

        assert_eq!(report.generation, Generation::G2);
        assert_eq!(report.formats, Formats::HEVC | Formats::VP9);
        assert!(report.aux.is_none());
    }

    #[test]
    fn test_probe_unknown_product() {
        let regs = bank(0x1234_0000, &[]);
        let result = HantroProbe.probe(CoreKind::Decoder, 0x4000, &regs);
        assert!(matches!(
            result,
            Err(BrokerError::UnknownHardware { base: 0x4000, id: 0x1234_0000 })
        ));

        // Encoder product on a decoder node is not a decoder
        let regs = bank(0x8000_6200, &[]);
        assert!(HantroProbe.probe(CoreKind::Decoder, 0, &regs).is_err());
    }

    #[test]
    fn test_encoder_clear_mode_by_major() {
        let modern = HantroProbe
            .probe(CoreKind::Encoder, 0, &bank(0x8000_6200, &[(ENC_SYNTH_CFG, 0x3)]))
            .unwrap();
        assert_eq!(modern.irq.clear, ClearMode::WriteOne);
        assert_eq!(modern.formats, Formats::HEVC | Formats::H264);

        let legacy = HantroProbe
            .probe(CoreKind::Encoder, 0, &bank(0x4831_6000, &[]))
            .unwrap();
        assert_eq!(legacy.irq.clear, ClearMode::WriteBackMasked(ENC_LEGACY_CLEAR_MASK));
        assert_eq!(legacy.irq.clear.clear_value(0x1ff), 0x02);
    }

    #[test]
    fn test_cache_window_resolution() {
        let probe = HantroProbe;

        // Cache and shaper: both directions
        let (offset, report) = probe.probe_cache(0, 0x0000_0100, CacheDir::Read).unwrap();
        assert_eq!(offset, CACHE_WITH_SHAPER_OFFSET);
        assert_eq!(report.irq.status_offset, CACHE_READ_STATUS_REG);
        let (offset, _) = probe.probe_cache(0, 0x0000_0100, CacheDir::Write).unwrap();
        assert_eq!(offset, SHAPER_OFFSET);

        // Cache only rejects write, shaper only rejects read
        let (offset, _) = probe.probe_cache(0, 0x0001_0000, CacheDir::Read).unwrap();
        assert_eq!(offset, CACHE_ONLY_OFFSET);
        assert!(probe.probe_cache(0, 0x0001_0000, CacheDir::Write).is_err());
        assert!(probe.probe_cache(0, 0x0002_0000, CacheDir::Read).is_err());
        assert!(probe.probe_cache(0, 0x0003_0000, CacheDir::Write).is_err());

        // Zero ID: legacy layout
        assert_eq!(probe.probe_cache(0, 0, CacheDir::Write).unwrap().0, 0);
        assert_eq!(
            probe.probe_cache(0, 0, CacheDir::Read).unwrap().0,
            CACHE_WITH_SHAPER_OFFSET
        );
    }
}
