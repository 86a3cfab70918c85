use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use gst::prelude::*;
use relay::{
    Bus, Driver, FlowError, FrameInfo, FrameQueue, Message, PixelFormat, Popped, Ports,
    RelayError, Rejected, Sample, Stage, State, StateChange,
};

use crate::element::GstElement;

const SLICE: Duration = Duration::from_millis(50);

fn gst_state(state: State) -> gst::State {
    match state {
        State::Null => gst::State::Null,
        State::Ready => gst::State::Ready,
        State::Paused => gst::State::Paused,
        State::Playing => gst::State::Playing,
    }
}

/// A `gst::Pipeline` built from one graph's stages.
pub(crate) struct GstDriver {
    pipeline: gst::Pipeline,
    bus: Bus,
    ports: Ports,
    appsrc: Option<gst_app::AppSrc>,
    running: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
    feeder: Option<JoinHandle<()>>,
}

impl GstDriver {
    pub(crate) fn assemble(stages: &[Stage], ports: Ports, bus: Bus) -> relay::Result<Self> {
        let pipeline = gst::Pipeline::with_name(&bus.graph().to_string());
        let mut chain: Vec<(String, gst::Element, gst::Element)> = Vec::with_capacity(stages.len());

        for stage in stages {
            let handle = stage.element();
            let mut element = handle.lock();
            let gst_element = element
                .as_any_mut()
                .downcast_mut::<GstElement>()
                .ok_or_else(|| RelayError::Configuration {
                    stage: stage.name().to_string(),
                    reason: "element was not created by the GStreamer engine".to_string(),
                })?;
            let members = gst_element.members();
            pipeline.add_many(&members).map_err(|e| engine_error(stage.name(), e))?;
            if members.len() > 1 {
                gst::Element::link_many(&members).map_err(|e| engine_error(stage.name(), e))?;
            }
            chain.push((
                stage.name().to_string(),
                gst_element.head.clone(),
                gst_element.tail.clone(),
            ));
        }

        for pair in chain.windows(2) {
            let (upstream, _, from) = &pair[0];
            let (downstream, to, _) = &pair[1];
            link(from, to).map_err(|reason| RelayError::Configuration {
                stage: downstream.clone(),
                reason: format!("cannot link {upstream} -> {downstream}: {reason}"),
            })?;
        }

        let appsrc = chain
            .first()
            .and_then(|(_, head, _)| head.clone().downcast::<gst_app::AppSrc>().ok());
        if let (Some(queue), Some((_, sink, _))) = (ports.sink.clone(), chain.last()) {
            let appsink = sink
                .clone()
                .downcast::<gst_app::AppSink>()
                .map_err(|_| engine_error("appsink", "sink is not an appsink"))?;
            connect_appsink(&appsink, queue, bus.clone());
        }

        tracing::debug!(graph = %bus.graph(), elements = chain.len(), "GStreamer pipeline assembled");
        Ok(Self {
            pipeline,
            bus,
            ports,
            appsrc,
            running: Arc::new(AtomicBool::new(false)),
            watcher: None,
            feeder: None,
        })
    }

    fn start_threads(&mut self) -> relay::Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let gst_bus = self
            .pipeline
            .bus()
            .ok_or_else(|| engine_error("pipeline", "pipeline has no bus"))?;
        let bus = self.bus.clone();
        let sink = self.ports.sink.clone();
        let running = self.running.clone();
        self.watcher = Some(
            thread::Builder::new()
                .name(format!("{}-gstbus", self.bus.graph()))
                .spawn(move || watch_bus(gst_bus, bus, sink, running))?,
        );

        if let (Some(appsrc), Some(queue)) = (self.appsrc.clone(), self.ports.source.clone()) {
            let running = self.running.clone();
            self.feeder = Some(
                thread::Builder::new()
                    .name(format!("{}-feed", self.bus.graph()))
                    .spawn(move || feed_appsrc(appsrc, queue, running))?,
            );
        }
        Ok(())
    }

    fn stop_threads(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in [self.watcher.take(), self.feeder.take()].into_iter().flatten() {
            let _ = handle.join();
        }
    }
}

impl Driver for GstDriver {
    fn change_state(&mut self, from: State, to: State) -> relay::Result<StateChange> {
        if to == State::Playing {
            self.start_threads()?;
        }
        let outcome = self
            .pipeline
            .set_state(gst_state(to))
            .map_err(|_| RelayError::StateChange { from, to })?;
        if from == State::Playing {
            self.stop_threads();
        }
        Ok(match outcome {
            gst::StateChangeSuccess::Async => StateChange::Async,
            _ => StateChange::Success,
        })
    }
}

impl Drop for GstDriver {
    fn drop(&mut self) {
        self.stop_threads();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn engine_error(stage: &str, error: impl std::fmt::Display) -> RelayError {
    RelayError::Engine {
        stage: Some(stage.to_string()),
        message: error.to_string(),
    }
}

/// Link two elements, deferring to `pad-added` for sources whose pads only
/// appear once streaming starts (`rtspsrc`).
fn link(from: &gst::Element, to: &gst::Element) -> Result<(), String> {
    let has_static_src = from
        .pad_template_list()
        .iter()
        .any(|t| t.direction() == gst::PadDirection::Src && t.presence() == gst::PadPresence::Always);
    if has_static_src {
        return from.link(to).map_err(|e| e.to_string());
    }

    let downstream = to.downgrade();
    from.connect_pad_added(move |src, pad| {
        let Some(to) = downstream.upgrade() else {
            return;
        };
        let Some(sink_pad) = to.static_pad("sink") else {
            return;
        };
        if sink_pad.is_linked() {
            return;
        }
        if let Err(e) = pad.link(&sink_pad) {
            tracing::warn!(element = %src.name(), pad = %pad.name(), error = ?e, "dynamic pad link failed");
        }
    });
    Ok(())
}

fn pixel_format(name: &str) -> Option<PixelFormat> {
    name.parse().ok()
}

/// Turn one appsink sample into a core sample without copying the pixels.
fn to_sample(sample: &gst::Sample, sequence: u64) -> Result<Sample, String> {
    let caps = sample.caps().ok_or("sample has no caps")?;
    let s = caps.structure(0).ok_or("caps have no structure")?;
    let width = s.get::<i32>("width").map_err(|e| e.to_string())?;
    let height = s.get::<i32>("height").map_err(|e| e.to_string())?;
    let format = s.get::<&str>("format").map_err(|e| e.to_string())?;
    let format = pixel_format(format).ok_or_else(|| format!("unsupported format {format}"))?;

    let buffer = sample.buffer_owned().ok_or("sample has no buffer")?;
    let pts = buffer.pts().map(|t| Duration::from_nanos(t.nseconds()));
    let mapped = buffer
        .into_mapped_buffer_readable()
        .map_err(|_| "buffer is not readable")?;

    let (width, height) = (width.unsigned_abs(), height.unsigned_abs());
    let mut info = FrameInfo::packed(width, height, format);
    if height > 0 {
        info.stride = (mapped.len() / height as usize).max(info.stride);
    }
    let mut sample =
        Sample::new(info, sequence, Bytes::from_owner(mapped)).map_err(|e| e.to_string())?;
    sample.pts = pts;
    Ok(sample)
}

fn connect_appsink(appsink: &gst_app::AppSink, queue: Arc<FrameQueue>, bus: Bus) {
    let sequence = AtomicU64::new(0);
    let name = appsink.name().to_string();
    let eos_queue = queue.clone();
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let sample = match to_sample(&sample, sequence.fetch_add(1, Ordering::Relaxed)) {
                    Ok(sample) => sample,
                    Err(message) => {
                        bus.post_error(Some(&name), message);
                        return Err(gst::FlowError::Error);
                    }
                };
                match queue.push(sample, None) {
                    Ok(()) => Ok(gst::FlowSuccess::Ok),
                    Err(Rejected {
                        reason: FlowError::EndOfStream,
                        ..
                    }) => Err(gst::FlowError::Eos),
                    Err(_) => Err(gst::FlowError::Flushing),
                }
            })
            .eos(move |_| eos_queue.end_of_stream())
            .build(),
    );
}

/// Move injected samples from the core queue into the `appsrc`. The bytes
/// are handed to GStreamer as they are; nothing is copied.
fn feed_appsrc(appsrc: gst_app::AppSrc, queue: Arc<FrameQueue>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match queue.pop(Some(SLICE)) {
            Popped::Sample(sample) => {
                let mut buffer = gst::Buffer::from_slice(sample.data);
                if let Some(buffer) = buffer.get_mut() {
                    buffer.set_offset(sample.sequence);
                }
                if appsrc.push_buffer(buffer).is_err() {
                    break;
                }
            }
            Popped::Timeout => {}
            Popped::EndOfStream => {
                let _ = appsrc.end_of_stream();
                break;
            }
            Popped::Flushing => break,
        }
    }
}

/// Close the appsink queue and wait until the application has popped
/// everything in it, or the pipeline leaves PLAYING.
fn drain_before_eos(queue: &FrameQueue, running: &AtomicBool) {
    queue.end_of_stream();
    while running.load(Ordering::SeqCst) && !queue.wait_drained(SLICE) {}
}

/// Forward end-of-stream and errors from the pipeline bus to the graph.
///
/// End-of-stream is held back until the application has taken every frame
/// queued at the appsink; the graph is torn down as soon as it is posted.
fn watch_bus(gst_bus: gst::Bus, bus: Bus, sink: Option<Arc<FrameQueue>>, running: Arc<AtomicBool>) {
    use gst::MessageView;

    let timeout = gst::ClockTime::from_mseconds(SLICE.as_millis() as u64);
    while running.load(Ordering::SeqCst) {
        let Some(msg) = gst_bus.timed_pop_filtered(
            timeout,
            &[gst::MessageType::Eos, gst::MessageType::Error, gst::MessageType::Warning],
        ) else {
            continue;
        };
        match msg.view() {
            MessageView::Eos(..) => {
                if let Some(queue) = &sink {
                    drain_before_eos(queue, &running);
                }
                tracing::debug!(graph = %bus.graph(), "pipeline reached end of stream");
                bus.post(Message::EndOfStream);
                break;
            }
            MessageView::Error(err) => {
                let stage = msg.src().map(|s| s.name().to_string());
                let mut message = err.error().to_string();
                if let Some(debug) = err.debug() {
                    message = format!("{message} ({debug})");
                }
                bus.post_error(stage.as_deref(), message);
                break;
            }
            MessageView::Warning(warning) => {
                tracing::warn!(
                    graph = %bus.graph(),
                    source = ?msg.src().map(|s| s.name()),
                    warning = %warning.error(),
                    "engine warning"
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sample(sequence: u64) -> Sample {
        let info = FrameInfo::packed(2, 1, PixelFormat::Gray8);
        Sample::new(info, sequence, Bytes::from(vec![0u8; 2])).unwrap()
    }

    #[test]
    fn eos_waits_for_queued_frames_to_be_taken() {
        let queue = Arc::new(FrameQueue::new(4, false));
        queue.push(sample(0), None).unwrap();
        queue.push(sample(1), None).unwrap();
        let running = AtomicBool::new(true);

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                let mut taken = 0;
                while let Popped::Sample(_) = queue.pop(Some(Duration::from_secs(1))) {
                    taken += 1;
                }
                taken
            })
        };

        let started = Instant::now();
        drain_before_eos(&queue, &running);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(queue.stats().queued, 0);
        assert_eq!(consumer.join().unwrap(), 2);
    }

    #[test]
    fn eos_wait_gives_up_when_pipeline_stops() {
        let queue = FrameQueue::new(4, false);
        queue.push(sample(0), None).unwrap();
        let running = AtomicBool::new(false);
        drain_before_eos(&queue, &running);
        assert_eq!(queue.stats().queued, 1);
    }
}
