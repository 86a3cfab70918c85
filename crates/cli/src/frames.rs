//! Frames for the `send` command: a generated pattern or a raw RGB file.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::Context;
use relay::FrameInfo;

enum Origin {
    Pattern { tick: u64 },
    File(BufReader<File>),
}

/// Produces packed frames into one reused buffer.
pub struct FrameSource {
    info: FrameInfo,
    origin: Origin,
    buf: Vec<u8>,
}

impl FrameSource {
    /// Vertical colour bars that scroll one pixel per frame.
    pub fn pattern(info: FrameInfo) -> Self {
        Self {
            info,
            origin: Origin::Pattern { tick: 0 },
            buf: vec![0; info.size()],
        }
    }

    /// Back-to-back frames of `info.size()` bytes each.
    pub fn file(path: &Path, info: FrameInfo) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        Ok(Self {
            info,
            origin: Origin::File(BufReader::new(file)),
            buf: vec![0; info.size()],
        })
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    /// The next frame, or `None` once a file runs out.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<&[u8]>> {
        match &mut self.origin {
            Origin::Pattern { tick } => {
                let bpp = self.info.format.bytes_per_pixel();
                let width = self.info.width as usize;
                for row in self.buf.chunks_mut(self.info.stride) {
                    for (x, px) in row[..width * bpp].chunks_mut(bpp).enumerate() {
                        let width = width.max(1) as u64;
                        let bar = ((x as u64 + *tick) % width * 8 / width) as u8;
                        px.fill(bar.wrapping_mul(32));
                    }
                }
                *tick += 1;
            }
            Origin::File(reader) => match reader.read_exact(&mut self.buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e).context("failed to read frame"),
            },
        }
        Ok(Some(&self.buf))
    }
}
