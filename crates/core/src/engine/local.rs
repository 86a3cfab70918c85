//! In-process engine for raw video chains.
//!
//! Runs one streaming thread per playing graph. Supports test and
//! application sources, pass-through filters, pixel layout conversion and
//! the application/null sinks. Anything that needs a real codec or network
//! stack belongs to another engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::bus::{Bus, Message};
use crate::catalog::Factory;
use crate::engine::{Driver, Engine, Ports, StateChange};
use crate::error::{FlowError, RelayError, Result};
use crate::exchange::{Popped, Rejected};
use crate::format::PixelFormat;
use crate::frame::{FrameInfo, Sample};
use crate::graph::State;
use crate::stage::{Element, ElementHandle, Properties, PropertyValue, Stage};

/// Poll interval of the streaming thread's blocking waits.
const SLICE: Duration = Duration::from_millis(50);

const SUPPORTED: &[&str] = &[
    "testsrc",
    "appsrc",
    "identity",
    "videoconvert",
    "nullcodec",
    "appsink",
    "fakesink",
];

/// Engine running raw-frame chains on plain threads.
#[derive(Debug, Clone, Default)]
pub struct LocalEngine {
    live: Arc<AtomicUsize>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elements created by this engine and not yet released.
    pub fn live_elements(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Engine for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports(&self, factory: &Factory) -> bool {
        SUPPORTED.contains(&factory.name)
    }

    fn make_element(
        &self,
        stage: &str,
        factory: &'static Factory,
        properties: &Properties,
    ) -> Result<Box<dyn Element>> {
        let kind = match factory.name {
            "testsrc" => Kind::TestSrc(TestSrc::default()),
            "appsrc" => Kind::AppSrc,
            "identity" => Kind::Identity {
                error_after: None,
                seen: 0,
            },
            "videoconvert" => Kind::Convert(None),
            "nullcodec" => Kind::NullCodec,
            "appsink" => Kind::AppSink,
            "fakesink" => Kind::FakeSink,
            other => {
                return Err(RelayError::config(
                    stage,
                    format!("{other} is not available in the local engine"),
                ));
            }
        };

        self.live.fetch_add(1, Ordering::SeqCst);
        let mut element = LocalElement {
            stage: stage.to_string(),
            kind,
            _live: LiveToken(self.live.clone()),
        };
        for (name, value) in properties.iter() {
            element.set_property(name, value)?;
        }
        Ok(Box::new(element))
    }

    fn assemble(&self, stages: &[Stage], ports: Ports, bus: Bus) -> Result<Box<dyn Driver>> {
        let mut chain = Vec::with_capacity(stages.len());
        for stage in stages {
            let handle = stage.element();
            let port_ok = match with_local(&handle, |e| e.kind.port()) {
                Some(Some(Port::Sink)) => ports.sink.is_some(),
                Some(Some(Port::Source)) => ports.source.is_some(),
                Some(None) => true,
                None => {
                    return Err(RelayError::config(
                        stage.name(),
                        "element was not created by the local engine",
                    ));
                }
            };
            if !port_ok {
                return Err(RelayError::config(stage.name(), "application port missing"));
            }
            chain.push((stage.name().to_string(), handle));
        }

        Ok(Box::new(LocalDriver {
            chain: Arc::new(chain),
            ports,
            bus,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }
}

struct LiveToken(Arc<AtomicUsize>);

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Port {
    Sink,
    Source,
}

struct TestSrc {
    num_buffers: Option<u64>,
    width: u32,
    height: u32,
    format: PixelFormat,
    framerate: u32,
    live: bool,
    solid: bool,
    produced: u64,
}

impl Default for TestSrc {
    fn default() -> Self {
        Self {
            num_buffers: None,
            width: 320,
            height: 240,
            format: PixelFormat::Rgb,
            framerate: 30,
            live: false,
            solid: false,
            produced: 0,
        }
    }
}

impl TestSrc {
    fn produce(&mut self) -> Option<Sample> {
        if self.num_buffers.is_some_and(|n| self.produced >= n) {
            return None;
        }
        let sequence = self.produced;
        let info = FrameInfo::packed(self.width, self.height, self.format);
        let mut data = vec![0u8; info.size()];
        if self.solid {
            data.fill(sequence as u8);
        } else {
            for (y, row) in data.chunks_mut(info.stride).enumerate() {
                row.fill((y as u64).wrapping_add(sequence) as u8);
            }
        }
        self.produced += 1;

        Some(Sample {
            info,
            sequence,
            pts: Some(self.frame_duration() * sequence as u32),
            data: Bytes::from(data),
        })
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.framerate.max(1)
    }
}

enum Kind {
    TestSrc(TestSrc),
    AppSrc,
    Identity { error_after: Option<u64>, seen: u64 },
    Convert(Option<PixelFormat>),
    NullCodec,
    AppSink,
    FakeSink,
}

impl Kind {
    fn port(&self) -> Option<Port> {
        match self {
            Self::AppSink => Some(Port::Sink),
            Self::AppSrc => Some(Port::Source),
            _ => None,
        }
    }
}

struct LocalElement {
    stage: String,
    kind: Kind,
    _live: LiveToken,
}

impl LocalElement {
    fn dimension(&self, name: &str, value: &PropertyValue) -> Result<u32> {
        value
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| RelayError::config(&self.stage, format!("{name} must be positive")))
    }

    /// Run one sample through a filter or codec.
    fn transform(&mut self, sample: Sample) -> std::result::Result<Sample, String> {
        match &mut self.kind {
            Kind::Identity { error_after, seen } => {
                *seen += 1;
                match error_after {
                    Some(n) if *seen >= *n => Err(format!("forced error after {n} buffers")),
                    _ => Ok(sample),
                }
            }
            Kind::Convert(Some(target)) if *target != sample.info.format => {
                Ok(convert(&sample, *target))
            }
            _ => Ok(sample),
        }
    }

    fn reset(&mut self) {
        match &mut self.kind {
            Kind::TestSrc(src) => src.produced = 0,
            Kind::Identity { seen, .. } => *seen = 0,
            _ => {}
        }
    }
}

impl Element for LocalElement {
    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<()> {
        let dimension = match name {
            "width" | "height" | "framerate" => Some(self.dimension(name, value)?),
            _ => None,
        };
        match (&mut self.kind, name) {
            (Kind::TestSrc(src), "num-buffers") => {
                src.num_buffers = value.as_i64().and_then(|n| u64::try_from(n).ok());
            }
            (Kind::TestSrc(src), "width") => src.width = dimension.unwrap_or(src.width),
            (Kind::TestSrc(src), "height") => src.height = dimension.unwrap_or(src.height),
            (Kind::TestSrc(src), "framerate") => {
                src.framerate = dimension.unwrap_or(src.framerate)
            }
            (Kind::TestSrc(src), "format") => {
                if let Some(format) = value.as_str().and_then(|f| f.parse().ok()) {
                    src.format = format;
                }
            }
            (Kind::TestSrc(src), "is-live") => src.live = value.as_bool().unwrap_or(false),
            (Kind::TestSrc(src), "pattern") => src.solid = value.as_str() == Some("solid"),
            (Kind::Identity { error_after, .. }, "error-after") => {
                *error_after = value
                    .as_i64()
                    .and_then(|n| u64::try_from(n).ok())
                    .filter(|n| *n > 0);
            }
            (Kind::Convert(target), "format") => {
                *target = value.as_str().and_then(|f| f.parse().ok());
            }
            // Remaining properties only affect other engines.
            _ => {}
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn with_local<R>(handle: &ElementHandle, f: impl FnOnce(&mut LocalElement) -> R) -> Option<R> {
    let mut element = handle.lock();
    element.as_any_mut().downcast_mut::<LocalElement>().map(f)
}

fn to_rgba(format: PixelFormat, px: &[u8]) -> [u8; 4] {
    match format {
        PixelFormat::Rgb => [px[0], px[1], px[2], 255],
        PixelFormat::Bgr => [px[2], px[1], px[0], 255],
        PixelFormat::Rgba => [px[0], px[1], px[2], px[3]],
        PixelFormat::Bgra => [px[2], px[1], px[0], px[3]],
        PixelFormat::Gray8 => [px[0], px[0], px[0], 255],
    }
}

fn put_rgba(format: PixelFormat, [r, g, b, a]: [u8; 4], out: &mut Vec<u8>) {
    match format {
        PixelFormat::Rgb => out.extend_from_slice(&[r, g, b]),
        PixelFormat::Bgr => out.extend_from_slice(&[b, g, r]),
        PixelFormat::Rgba => out.extend_from_slice(&[r, g, b, a]),
        PixelFormat::Bgra => out.extend_from_slice(&[b, g, r, a]),
        PixelFormat::Gray8 => {
            let luma = (u32::from(r) * 77 + u32::from(g) * 150 + u32::from(b) * 29) >> 8;
            out.push(luma as u8);
        }
    }
}

/// Repack a frame into `target`, dropping any row padding.
fn convert(sample: &Sample, target: PixelFormat) -> Sample {
    let src = sample.info;
    let info = FrameInfo::packed(src.width, src.height, target);
    let bpp = src.format.bytes_per_pixel();
    let mut out = Vec::with_capacity(info.size());
    for row in sample.data.chunks(src.stride).take(src.height as usize) {
        for px in row[..src.format.stride(src.width)].chunks_exact(bpp) {
            put_rgba(target, to_rgba(src.format, px), &mut out);
        }
    }
    Sample {
        info,
        sequence: sample.sequence,
        pts: sample.pts,
        data: Bytes::from(out),
    }
}

type Chain = Arc<Vec<(String, ElementHandle)>>;

struct LocalDriver {
    chain: Chain,
    ports: Ports,
    bus: Bus,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl LocalDriver {
    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let streamer = Streamer {
            chain: self.chain.clone(),
            ports: self.ports.clone(),
            bus: self.bus.clone(),
            running: self.running.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("{}-stream", self.bus.graph()))
            .spawn(move || streamer.run())?;
        self.worker = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
    }
}

impl Driver for LocalDriver {
    fn change_state(&mut self, from: State, to: State) -> Result<StateChange> {
        match (from, to) {
            (State::Paused, State::Playing) => self.start()?,
            (State::Playing, State::Paused) => self.stop(),
            (State::Paused, State::Ready) => {
                for (_, element) in self.chain.iter() {
                    with_local(element, LocalElement::reset);
                }
            }
            _ => {}
        }
        Ok(StateChange::Success)
    }
}

impl Drop for LocalDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Next {
    Sample(Sample),
    Idle,
    Done,
    Stopped,
}

struct Streamer {
    chain: Chain,
    ports: Ports,
    bus: Bus,
    running: Arc<AtomicBool>,
}

impl Streamer {
    fn run(self) {
        let graph = self.bus.graph();
        let Some(((_, source), rest)) = self.chain.split_first() else {
            return;
        };
        let Some(((_, sink), filters)) = rest.split_last() else {
            return;
        };
        let pace = with_local(source, |e| match &e.kind {
            Kind::TestSrc(src) if src.live => Some(src.frame_duration()),
            _ => None,
        })
        .flatten();
        let to_app = with_local(sink, |e| matches!(e.kind, Kind::AppSink)).unwrap_or(false);

        tracing::debug!(%graph, "streaming started");
        let mut due = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            let mut sample = match self.next(source) {
                Next::Sample(sample) => sample,
                Next::Idle => continue,
                Next::Stopped => break,
                Next::Done => {
                    if let Some(queue) = &self.ports.sink {
                        queue.end_of_stream();
                        // EOS is only announced once the application has
                        // taken every frame.
                        while self.running.load(Ordering::SeqCst) && !queue.wait_drained(SLICE) {}
                    }
                    tracing::debug!(%graph, "source exhausted");
                    self.bus.post(Message::EndOfStream);
                    break;
                }
            };

            for (name, element) in filters {
                match with_local(element, |e| e.transform(sample)) {
                    Some(Ok(out)) => sample = out,
                    Some(Err(message)) => {
                        self.fail(name, message);
                        return;
                    }
                    None => {
                        self.fail(name, "element was not created by the local engine".into());
                        return;
                    }
                }
            }

            if to_app && !self.deliver(sample) {
                break;
            }

            if let Some(interval) = pace {
                due += interval;
                while self.running.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if now >= due {
                        break;
                    }
                    thread::park_timeout(due - now);
                }
            }
        }
        tracing::debug!(%graph, "streaming stopped");
    }

    fn next(&self, source: &ElementHandle) -> Next {
        let produced = with_local(source, |e| match &mut e.kind {
            Kind::TestSrc(src) => Some(src.produce()),
            _ => None,
        })
        .flatten();
        if let Some(sample) = produced {
            return sample.map_or(Next::Done, Next::Sample);
        }

        let Some(queue) = &self.ports.source else {
            return Next::Done;
        };
        match queue.pop(Some(SLICE)) {
            Popped::Sample(sample) => Next::Sample(sample),
            Popped::Timeout => Next::Idle,
            Popped::EndOfStream => Next::Done,
            Popped::Flushing => Next::Stopped,
        }
    }

    /// Hand a sample to the appsink, waiting while it is full.
    fn deliver(&self, mut sample: Sample) -> bool {
        let Some(queue) = &self.ports.sink else {
            return true;
        };
        loop {
            match queue.push(sample, Some(SLICE)) {
                Ok(()) => return true,
                Err(Rejected {
                    reason: FlowError::Full,
                    sample: rejected,
                }) if self.running.load(Ordering::SeqCst) => sample = rejected,
                Err(_) => return false,
            }
        }
    }

    fn fail(&self, stage: &str, message: String) {
        tracing::debug!(graph = %self.bus.graph(), stage, %message, "stage failed");
        self.bus.post_error(Some(stage), message);
        if let Some(queue) = &self.ports.sink {
            queue.end_of_stream();
        }
    }
}
