mod frames;
mod source;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay::{
    Engine, EventLoop, Flow, FrameBuffer, FrameInfo, GraphConfig, LocalEngine,
    MountPolicy, PipelineGraph, PixelFormat, Pulled, RelayError, ServerConfig, SessionServer,
    State,
};
use tracing_subscriber::EnvFilter;

use crate::frames::FrameSource;
use crate::source::{TO_APP, receive_chain, send_chain};

/// First wait after a push is refused as full; doubled up to `MAX_BACKOFF`.
const BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "relay", version, about = "Receive, run and restream video pipelines")]
struct Args {
    /// Run on the built-in engine even when GStreamer support is compiled in.
    #[arg(long, global = true)]
    local: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Receive a stream and report the frames that arrive.
    Pull {
        /// Source URL: tcp://, udp://, rtsp://, rtmp:// or test://
        url: String,
        /// Stop after this many frames.
        #[arg(long, short = 'n')]
        frames: Option<u64>,
    },
    /// Restream a source to network clients through a session server.
    Serve {
        /// Source URL: tcp://, udp://, rtsp://, rtmp:// or test://
        url: String,
        /// Mount path clients play.
        #[arg(long, default_value = "/test")]
        mount: String,
        #[arg(long, short, default_value_t = 8554)]
        port: u16,
        /// Interface to listen on.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Share one source graph between all clients instead of one each.
        #[arg(long)]
        shared: bool,
    },
    /// Encode frames produced here and send them to a destination.
    Send {
        /// Destination URL: udp://host:port or null://
        url: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Frames per second.
        #[arg(long, default_value_t = 30)]
        framerate: u32,
        /// Stop after this many frames.
        #[arg(long, short = 'n')]
        frames: Option<u64>,
        /// Raw packed RGB file to send instead of a generated pattern.
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Run a pipeline description until end-of-stream, error or Ctrl-C.
    Launch {
        /// For example: "testsrc num-buffers=100 ! videoconvert format=GRAY8 ! appsink"
        description: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = engine(args.local).and_then(|engine| match args.command {
        Command::Pull { url, frames } => pull(engine.as_ref(), &url, frames),
        Command::Serve {
            url,
            mount,
            port,
            host,
            shared,
        } => serve(engine, &url, &mount, host, port, shared),
        Command::Send {
            url,
            width,
            height,
            framerate,
            frames,
            input,
        } => {
            let info = FrameInfo::packed(width, height, PixelFormat::Rgb);
            let source = match input {
                Some(path) => FrameSource::file(&path, info),
                None => Ok(FrameSource::pattern(info)),
            };
            source.and_then(|source| send(engine.as_ref(), &url, source, framerate, frames))
        }
        Command::Launch { description } => launch(engine.as_ref(), &description),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            exit_code(&e)
        }
    }
}

/// 2 for problems with what the user asked for, 1 for failures at run time.
fn exit_code(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<RelayError>() {
        Some(RelayError::Configuration { .. } | RelayError::Bind { .. }) | None => {
            ExitCode::from(2)
        }
        Some(_) => ExitCode::from(1),
    }
}

#[cfg(feature = "gst")]
fn engine(local: bool) -> anyhow::Result<Arc<dyn Engine>> {
    if local {
        return Ok(Arc::new(LocalEngine::new()));
    }
    Ok(Arc::new(relay_gst::GstEngine::new()?))
}

#[cfg(not(feature = "gst"))]
fn engine(_local: bool) -> anyhow::Result<Arc<dyn Engine>> {
    Ok(Arc::new(LocalEngine::new()))
}

/// Pull frames on this thread; Ctrl-C tears the graph down from the signal
/// thread, which ends the pull with end-of-stream.
fn pull(engine: &dyn Engine, url: &str, limit: Option<u64>) -> anyhow::Result<()> {
    let text = format!("{} ! {TO_APP}", receive_chain(url)?);
    let graph = PipelineGraph::from_description(engine, &text, GraphConfig::default())?;
    let mut exchange = graph.pull_exchange()?;

    let remote = graph.clone();
    ctrlc::set_handler(move || remote.teardown()).context("failed to install Ctrl-C handler")?;

    graph.set_state(State::Playing)?;
    tracing::info!(%url, graph = %graph.id(), "pulling");

    let started = Instant::now();
    let mut received = 0u64;
    let mut last_report = Instant::now();
    loop {
        match exchange.pull_next()? {
            Pulled::Frame(guard) => {
                let frame = guard.frame();
                tracing::debug!(
                    sequence = guard.sequence(),
                    width = frame.width(),
                    height = frame.height(),
                    format = %frame.format(),
                    bytes = frame.data().len(),
                    "frame"
                );
                received += 1;
            }
            Pulled::Timeout => {
                tracing::debug!("no frame yet");
            }
            Pulled::EndOfStream => break,
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            tracing::info!(frames = received, "receiving");
            last_report = Instant::now();
        }
        if limit.is_some_and(|n| received >= n) {
            break;
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        frames = received,
        seconds = %format_args!("{elapsed:.1}"),
        "stream finished"
    );
    drop(exchange);
    graph.teardown();
    Ok(())
}

fn serve(
    engine: Arc<dyn Engine>,
    url: &str,
    mount: &str,
    host: String,
    port: u16,
    shared: bool,
) -> anyhow::Result<()> {
    let text = format!("{} ! {TO_APP}", receive_chain(url)?);
    let server = SessionServer::with_config(
        engine,
        ServerConfig {
            host,
            ..ServerConfig::default()
        },
    )?;
    let policy = if shared {
        MountPolicy::Shared
    } else {
        MountPolicy::Exclusive
    };
    let addr = server.bind_with_policy(mount, &text, port, policy)?;
    tracing::info!(source = %url, "serving rtsp://{addr}{mount}");

    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("failed to install Ctrl-C handler")?;
    let _ = rx.recv();

    server.stop();
    Ok(())
}

/// Push frames into an `appsrc` graph at `framerate`. A refusal the graph
/// may recover from is retried with growing pauses; a frame still refused after the longest
/// pause is dropped.
fn send(
    engine: &dyn Engine,
    url: &str,
    mut source: FrameSource,
    framerate: u32,
    limit: Option<u64>,
) -> anyhow::Result<()> {
    let info = source.info();
    let text = send_chain(url, info.width, info.height)?;
    let graph = PipelineGraph::from_description(engine, &text, GraphConfig::default())?;
    let mut injector = graph.injector()?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    graph.set_state(State::Playing)?;
    tracing::info!(%url, graph = %graph.id(), width = info.width, height = info.height, "sending");

    let interval = Duration::from_secs(1) / framerate.max(1);
    let mut due = Instant::now();
    let mut dropped = 0u64;
    while running.load(Ordering::SeqCst) && !limit.is_some_and(|n| injector.pushed() >= n) {
        if let Some(error) = graph.fault() {
            graph.teardown();
            return Err(error.into());
        }
        let Some(data) = source.next_frame()? else {
            break;
        };
        let frame = FrameBuffer::borrowed(info, data)?;

        let mut backoff = BACKOFF;
        loop {
            match injector.push(frame.clone()) {
                Ok(()) => break,
                Err(e) if e.is_recoverable() && backoff <= MAX_BACKOFF => {
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) if e.is_recoverable() => {
                    dropped += 1;
                    tracing::warn!(sequence = injector.pushed(), dropped, error = %e, "frame dropped");
                    break;
                }
                Err(e) => {
                    graph.teardown();
                    return Err(e.into());
                }
            }
        }

        due += interval;
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    injector.end_of_stream();
    let events = EventLoop::new();
    let finished = events.wait_for_termination(&graph, Duration::from_secs(5));
    graph.teardown();
    let finished = finished?;
    tracing::info!(frames = injector.pushed(), dropped, drained = finished, "send finished");
    Ok(())
}

fn launch(engine: &dyn Engine, description: &str) -> anyhow::Result<()> {
    let graph = PipelineGraph::from_description(engine, description, GraphConfig::default())?;

    // Frames reaching an appsink are counted so the chain never stalls.
    let counted = Arc::new(AtomicU64::new(0));
    let callback = if graph.sink_stats().is_some() {
        let counted = counted.clone();
        Some(graph.connect_frames(move |_| {
            counted.fetch_add(1, Ordering::Relaxed);
            Flow::Continue
        })?)
    } else {
        None
    };

    let events = EventLoop::new();
    events.watch(&graph);
    let stop = events.stop_handle();
    ctrlc::set_handler(move || stop.stop()).context("failed to install Ctrl-C handler")?;

    graph.set_state(State::Playing)?;
    tracing::info!(graph = %graph.id(), "{}", graph.description()?);

    let exit = events.run();
    graph.teardown();
    if let Some(callback) = callback {
        callback.join();
    }
    tracing::info!(reason = ?exit.reason, frames = counted.load(Ordering::Relaxed), "pipeline finished");

    match exit.errors.into_iter().next() {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}
