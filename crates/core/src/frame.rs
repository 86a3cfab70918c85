//! Raw frame buffers crossing the application boundary.
//!
//! A [`FrameBuffer`] is a view over pixel data with an explicit ownership
//! mode:
//!
//! - **Borrowed**: the view points into memory owned by someone else (a
//!   pulled sample, a capture buffer). Its lifetime parameter ties it to
//!   that owner, so it cannot be retained past the call that produced it.
//! - **Owned copy**: the view owns its bytes and is `'static`; it can be
//!   stored, sent to another thread, or handed to the engine.
//!
//! [`Sample`] is the engine-side unit that travels through frame queues.
//! It always owns its data.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{RelayError, Result};
use crate::format::PixelFormat;

/// Geometry and layout of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes per row, including any padding.
    pub stride: usize,
}

impl FrameInfo {
    /// Layout with tightly packed rows.
    pub fn packed(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            stride: format.stride(width),
        }
    }

    /// Minimum number of bytes a frame with this layout occupies.
    pub fn size(&self) -> usize {
        self.stride * self.height as usize
    }

    fn check(&self, len: usize) -> Result<()> {
        if self.stride < self.format.stride(self.width) {
            return Err(RelayError::InvalidFrame(format!(
                "stride {} is shorter than a {}px {} row",
                self.stride, self.width, self.format
            )));
        }
        if len < self.size() {
            return Err(RelayError::InvalidFrame(format!(
                "{len} bytes cannot hold a {}x{} {} frame ({} bytes)",
                self.width,
                self.height,
                self.format,
                self.size()
            )));
        }
        Ok(())
    }
}

/// Whether a [`FrameBuffer`] may outlive the call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Borrowed,
    OwnedCopy,
}

#[derive(Debug, Clone)]
enum FrameData<'a> {
    Borrowed(&'a [u8]),
    Owned(Bytes),
}

/// A view over raw pixel data.
#[derive(Debug, Clone)]
pub struct FrameBuffer<'a> {
    info: FrameInfo,
    sequence: u64,
    pts: Option<Duration>,
    data: FrameData<'a>,
}

impl<'a> FrameBuffer<'a> {
    /// Wrap memory owned by the caller without copying it.
    pub fn borrowed(info: FrameInfo, data: &'a [u8]) -> Result<Self> {
        info.check(data.len())?;
        Ok(Self {
            info,
            sequence: 0,
            pts: None,
            data: FrameData::Borrowed(data),
        })
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn format(&self) -> PixelFormat {
        self.info.format
    }

    pub fn stride(&self) -> usize {
        self.info.stride
    }

    /// Capture order of this frame within its graph.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn pts(&self) -> Option<Duration> {
        self.pts
    }

    pub fn ownership(&self) -> Ownership {
        match self.data {
            FrameData::Borrowed(_) => Ownership::Borrowed,
            FrameData::Owned(_) => Ownership::OwnedCopy,
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            FrameData::Borrowed(d) => *d,
            FrameData::Owned(d) => &d[..],
        }
    }

    /// Pixel bytes of row `y`, without stride padding.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.info.height {
            return None;
        }
        let start = y as usize * self.info.stride;
        let len = self.info.format.stride(self.info.width);
        self.data().get(start..start + len)
    }

    /// Copy the pixels into an owned frame that may be retained.
    pub fn to_owned_copy(&self) -> FrameBuffer<'static> {
        FrameBuffer {
            info: self.info,
            sequence: self.sequence,
            pts: self.pts,
            data: FrameData::Owned(Bytes::copy_from_slice(self.data())),
        }
    }

    /// Convert into an owned frame, copying only if the data is borrowed.
    pub fn into_owned(self) -> FrameBuffer<'static> {
        match self.data {
            FrameData::Owned(data) => FrameBuffer {
                info: self.info,
                sequence: self.sequence,
                pts: self.pts,
                data: FrameData::Owned(data),
            },
            FrameData::Borrowed(data) => FrameBuffer {
                info: self.info,
                sequence: self.sequence,
                pts: self.pts,
                data: FrameData::Owned(Bytes::copy_from_slice(data)),
            },
        }
    }

    /// Copy-at-boundary conversion used when a frame enters the engine.
    pub(crate) fn into_sample(self) -> Sample {
        let data = match self.data {
            FrameData::Owned(data) => data,
            FrameData::Borrowed(data) => Bytes::copy_from_slice(data),
        };
        Sample {
            info: self.info,
            sequence: self.sequence,
            pts: self.pts,
            data,
        }
    }
}

impl FrameBuffer<'static> {
    /// Take ownership of `data`; no copy is made.
    pub fn owned(info: FrameInfo, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        info.check(data.len())?;
        Ok(Self {
            info,
            sequence: 0,
            pts: None,
            data: FrameData::Owned(data),
        })
    }
}

/// One frame as it travels between stages and through frame queues.
///
/// Engines create samples; the application only ever sees them through a
/// [`FrameBuffer`] view.
#[derive(Debug, Clone)]
pub struct Sample {
    pub info: FrameInfo,
    pub sequence: u64,
    pub pts: Option<Duration>,
    pub data: Bytes,
}

impl Sample {
    pub fn new(info: FrameInfo, sequence: u64, data: Bytes) -> Result<Self> {
        info.check(data.len())?;
        Ok(Self {
            info,
            sequence,
            pts: None,
            data,
        })
    }

    /// Borrowed view, valid for as long as the sample is.
    pub fn view(&self) -> FrameBuffer<'_> {
        FrameBuffer {
            info: self.info,
            sequence: self.sequence,
            pts: self.pts,
            data: FrameData::Borrowed(&self.data[..]),
        }
    }

    /// Owned view sharing this sample's bytes (reference-counted, no copy).
    pub fn shared_view(&self) -> FrameBuffer<'static> {
        FrameBuffer {
            info: self.info,
            sequence: self.sequence,
            pts: self.pts,
            data: FrameData::Owned(self.data.clone()),
        }
    }

    /// Independent deep copy.
    pub fn deep_copy(&self) -> Sample {
        Sample {
            info: self.info,
            sequence: self.sequence,
            pts: self.pts,
            data: Bytes::copy_from_slice(&self.data),
        }
    }
}
