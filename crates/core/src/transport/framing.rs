//! Interleaved frame framing on the control connection.
//!
//! After a successful `PLAY` the server writes raw frames on the same TCP
//! connection, each as one interleaved packet:
//!
//! ```text
//! +-----+---------+----------------+------------------------------+
//! | '$' | channel | length (u32 BE)| frame header | pixel data    |
//! +-----+---------+----------------+------------------------------+
//!
//! frame header (24 bytes, big-endian):
//!   width u32 | height u32 | stride u32 | format u8 | 3 reserved | sequence u64
//! ```
//!
//! `length` counts the frame header plus the pixel data. Control responses
//! never start with `$`, so a client can tell the two apart by the first
//! byte.

use std::io::{self, Read, Write};

use crate::format::PixelFormat;
use crate::frame::{FrameBuffer, FrameInfo};

pub const MAGIC: u8 = b'$';
pub const FRAME_HEADER_LEN: usize = 24;
/// Channel used for video frames.
pub const VIDEO_CHANNEL: u8 = 0;

/// Encode one frame as an interleaved packet.
pub fn encode_frame(channel: u8, frame: &FrameBuffer<'_>) -> io::Result<Vec<u8>> {
    let info = frame.info();
    let pixels = &frame.data()[..info.size()];
    let length = u32::try_from(FRAME_HEADER_LEN + pixels.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    let stride = u32::try_from(info.stride)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "stride too large"))?;

    let mut packet = Vec::with_capacity(6 + length as usize);
    packet.push(MAGIC);
    packet.push(channel);
    packet.extend_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(&info.width.to_be_bytes());
    packet.extend_from_slice(&info.height.to_be_bytes());
    packet.extend_from_slice(&stride.to_be_bytes());
    packet.push(info.format.wire_code());
    packet.extend_from_slice(&[0; 3]);
    packet.extend_from_slice(&frame.sequence().to_be_bytes());
    packet.extend_from_slice(pixels);
    Ok(packet)
}

pub fn write_frame(writer: &mut impl Write, channel: u8, frame: &FrameBuffer<'_>) -> io::Result<()> {
    writer.write_all(&encode_frame(channel, frame)?)
}

/// A frame read back from the wire.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub channel: u8,
    pub info: FrameInfo,
    pub sequence: u64,
    pub data: Vec<u8>,
}

impl WireFrame {
    pub fn view(&self) -> Option<FrameBuffer<'_>> {
        FrameBuffer::borrowed(self.info, &self.data)
            .ok()
            .map(|f| f.with_sequence(self.sequence))
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Read one interleaved packet. The leading `$` must be next in the stream.
pub fn read_frame(reader: &mut impl Read) -> io::Result<WireFrame> {
    let mut prefix = [0u8; 6];
    reader.read_exact(&mut prefix)?;
    if prefix[0] != MAGIC {
        return Err(invalid("missing interleaved frame marker"));
    }
    let length = u32::from_be_bytes([prefix[2], prefix[3], prefix[4], prefix[5]]) as usize;
    if length < FRAME_HEADER_LEN {
        return Err(invalid("interleaved packet shorter than frame header"));
    }

    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let word = |i: usize| u32::from_be_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    let format = PixelFormat::from_wire_code(header[12]).ok_or_else(|| invalid("unknown pixel format"))?;
    let mut sequence = [0u8; 8];
    sequence.copy_from_slice(&header[16..24]);

    let info = FrameInfo {
        width: word(0),
        height: word(4),
        format,
        stride: word(8) as usize,
    };
    let mut data = vec![0u8; length - FRAME_HEADER_LEN];
    reader.read_exact(&mut data)?;
    if data.len() < info.size() {
        return Err(invalid("frame data shorter than its header claims"));
    }

    Ok(WireFrame {
        channel: prefix[1],
        info,
        sequence: u64::from_be_bytes(sequence),
        data,
    })
}
