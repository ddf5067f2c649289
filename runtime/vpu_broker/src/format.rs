//! Codec formats and capability masks
//!
//! Bit positions follow the client type numbers the user-space codec
//! libraries already pass in (H264 = 1 ... HEVC = 12), so a raw request
//! value converts to a mask with a single shift.

use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Set of codec formats a core can process
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Formats: u32 {
        const H264 = 1 << 1;
        const MPEG4 = 1 << 2;
        const JPEG = 1 << 3;
        const PP = 1 << 4;
        const VC1 = 1 << 5;
        const MPEG2 = 1 << 6;
        const VP6 = 1 << 7;
        const AVS = 1 << 8;
        const RV = 1 << 9;
        const VP8 = 1 << 10;
        const VP9 = 1 << 11;
        const HEVC = 1 << 12;
    }
}

impl Formats {
    /// Formats in ascending client type order
    pub fn formats(self) -> impl Iterator<Item = CodecFormat> {
        CodecFormat::ALL
            .into_iter()
            .filter(move |f| self.contains(f.flag()))
    }
}

impl fmt::Display for Formats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        for (i, format) in self.formats().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{format}")?;
        }
        Ok(())
    }
}

/// One codec format a client can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFormat {
    H264 = 1,
    Mpeg4 = 2,
    Jpeg = 3,
    #[serde(rename = "pp")]
    PostProcessor = 4,
    Vc1 = 5,
    Mpeg2 = 6,
    Vp6 = 7,
    Avs = 8,
    Rv = 9,
    Vp8 = 10,
    Vp9 = 11,
    Hevc = 12,
}

impl CodecFormat {
    pub const ALL: [CodecFormat; 12] = [
        CodecFormat::H264,
        CodecFormat::Mpeg4,
        CodecFormat::Jpeg,
        CodecFormat::PostProcessor,
        CodecFormat::Vc1,
        CodecFormat::Mpeg2,
        CodecFormat::Vp6,
        CodecFormat::Avs,
        CodecFormat::Rv,
        CodecFormat::Vp8,
        CodecFormat::Vp9,
        CodecFormat::Hevc,
    ];

    /// Convert a raw client type as passed through the control surface
    pub fn from_client_type(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.client_type() == raw)
    }

    pub fn client_type(self) -> u32 {
        self as u32
    }

    /// Single-bit capability mask for this format
    pub fn flag(self) -> Formats {
        Formats::from_bits_retain(1 << self.client_type())
    }
}

impl fmt::Display for CodecFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecFormat::H264 => "H264",
            CodecFormat::Mpeg4 => "MPEG4",
            CodecFormat::Jpeg => "JPEG",
            CodecFormat::PostProcessor => "PP",
            CodecFormat::Vc1 => "VC1",
            CodecFormat::Mpeg2 => "MPEG2",
            CodecFormat::Vp6 => "VP6",
            CodecFormat::Avs => "AVS",
            CodecFormat::Rv => "RV",
            CodecFormat::Vp8 => "VP8",
            CodecFormat::Vp9 => "VP9",
            CodecFormat::Hevc => "HEVC",
        };
        f.write_str(name)
    }
}
