//! Media formats carried between stages.
//!
//! Negotiation is deliberately coarse: the core only needs to know whether
//! a link carries raw pixels (and in which layout), an encoded bitstream,
//! or something the engine will sort out on its own ([`Format::Any`]).

use std::fmt;
use std::str::FromStr;

/// Raw pixel layouts understood by the frame boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb,
    Bgr,
    Rgba,
    Bgra,
    Gray8,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 5] = [
        PixelFormat::Rgb,
        PixelFormat::Bgr,
        PixelFormat::Rgba,
        PixelFormat::Bgra,
        PixelFormat::Gray8,
    ];

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb | Self::Bgr => 3,
            Self::Rgba | Self::Bgra => 4,
            Self::Gray8 => 1,
        }
    }

    /// Tightly packed row length in bytes.
    pub fn stride(self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel()
    }

    /// Name used in descriptions and engine caps (`RGB`, `BGRx`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rgb => "RGB",
            Self::Bgr => "BGR",
            Self::Rgba => "RGBA",
            Self::Bgra => "BGRA",
            Self::Gray8 => "GRAY8",
        }
    }

    /// Stable one-byte code used in the interleaved frame header.
    pub fn wire_code(self) -> u8 {
        match self {
            Self::Rgb => 1,
            Self::Bgr => 2,
            Self::Rgba => 3,
            Self::Bgra => 4,
            Self::Gray8 => 5,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.wire_code() == code)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown pixel format '{s}'"))
    }
}

/// Encoded bitstreams a stage may produce or consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    Mp4v,
}

/// What flows over one link of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// Decoded pixels in a known layout.
    Raw(PixelFormat),
    /// Decoded pixels, layout decided by the engine at run time.
    AnyRaw,
    /// Elementary stream of the given codec.
    Encoded(Codec),
    /// RTP packets carrying the given codec.
    Rtp(Codec),
    /// Unknown until the engine negotiates (network sources, depayloaders).
    Any,
}

impl Format {
    pub fn is_raw(self) -> bool {
        matches!(self, Self::Raw(_) | Self::AnyRaw)
    }

    /// Whether a stage accepting `accepted` can take this format as input.
    ///
    /// [`Format::Any`] on either side defers the decision to the engine.
    pub fn fits(self, accepted: Format) -> bool {
        match (self, accepted) {
            (Format::Any, _) | (_, Format::Any) => true,
            (Format::Raw(_) | Format::AnyRaw, Format::AnyRaw) => true,
            (Format::AnyRaw, Format::Raw(_)) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(p) => write!(f, "video/x-raw,format={p}"),
            Self::AnyRaw => write!(f, "video/x-raw"),
            Self::Encoded(Codec::H264) => write!(f, "video/x-h264"),
            Self::Encoded(Codec::Mp4v) => write!(f, "video/mpeg"),
            Self::Rtp(c) => write!(f, "application/x-rtp,encoding={c:?}"),
            Self::Any => write!(f, "ANY"),
        }
    }
}
