//! End-to-end graph behavior on the local engine: lifecycle, frame
//! exchange in both directions, and teardown from other threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use relay::{
    Description, EventLoop, ExitReason, Flow, FlowError, FrameBuffer, FrameInfo, GraphConfig,
    LocalEngine, PipelineGraph, PixelFormat, Pulled, RelayError, State,
};

const PULL_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn build(engine: &LocalEngine, text: &str) -> PipelineGraph {
    PipelineGraph::from_description(engine, text, GraphConfig::default()).expect("build graph")
}

#[test]
fn pulls_exactly_num_buffers_then_end_of_stream() {
    let engine = LocalEngine::new();
    let graph = build(&engine, "testsrc num-buffers=10 width=64 height=64 ! nullcodec ! appsink");
    let mut exchange = graph.pull_exchange().unwrap();
    graph.set_state(State::Playing).unwrap();

    let mut sequences = Vec::new();
    for _ in 0..10 {
        match exchange.pull(PULL_TIMEOUT).unwrap() {
            Pulled::Frame(guard) => {
                let frame = guard.frame();
                assert_eq!((frame.width(), frame.height()), (64, 64));
                assert_eq!(frame.format(), PixelFormat::Rgb);
                assert!(frame.data().len() >= 64 * 64 * 3);
                sequences.push(guard.sequence());
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }
    assert!(matches!(exchange.pull(PULL_TIMEOUT).unwrap(), Pulled::EndOfStream));
    assert_eq!(sequences, (0..10).collect::<Vec<u64>>());
    assert_eq!(exchange.released(), 10);

    drop(exchange);
    graph.teardown();
    assert_eq!(engine.live_elements(), 0);
}

#[test]
fn finished_stream_plays_again_after_ready() {
    let engine = LocalEngine::new();
    let graph = build(&engine, "testsrc num-buffers=2 width=8 height=8 ! appsink");
    let mut exchange = graph.pull_exchange().unwrap();

    for round in 0..2 {
        graph.set_state(State::Playing).unwrap();
        let mut sequences = Vec::new();
        loop {
            match exchange.pull(PULL_TIMEOUT).unwrap() {
                Pulled::Frame(guard) => sequences.push(guard.sequence()),
                Pulled::EndOfStream => break,
                Pulled::Timeout => panic!("round {round}: timed out"),
            }
        }
        assert_eq!(sequences, [0, 1], "round {round}");
        graph.set_state(State::Ready).unwrap();
    }

    drop(exchange);
    graph.teardown();
    assert_eq!(engine.live_elements(), 0);
}

#[test]
fn build_then_teardown_releases_every_element() {
    let engine = LocalEngine::new();
    for _ in 0..20 {
        let graph = build(
            &engine,
            "testsrc width=16 height=16 ! videoconvert format=GRAY8 ! identity ! appsink",
        );
        assert_eq!(engine.live_elements(), 4);
        graph.set_state(State::Playing).unwrap();
        graph.teardown();
        assert_eq!(engine.live_elements(), 0);
    }
}

#[test]
fn teardown_from_another_thread_unblocks_pull() {
    let engine = LocalEngine::new();
    // appsrc with nothing pushed: the sink stays empty forever.
    let graph = build(&engine, "appsrc ! appsink");
    let mut exchange = graph.pull_exchange().unwrap();
    graph.set_state(State::Playing).unwrap();

    let remote = graph.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.teardown();
    });

    let started = Instant::now();
    let pulled = exchange.pull(None).unwrap();
    assert!(matches!(pulled, Pulled::EndOfStream));
    assert!(started.elapsed() < Duration::from_secs(5));
    stopper.join().unwrap();
    assert!(graph.is_torn_down());
}

#[test]
fn push_before_playing_fails_without_blocking() {
    let engine = LocalEngine::new();
    let graph = build(&engine, "appsrc format=RGB width=4 height=4 ! appsink");
    let mut injector = graph.injector().unwrap();

    let info = FrameInfo::packed(4, 4, PixelFormat::Rgb);
    let data = vec![0u8; info.size()];
    let started = Instant::now();
    let err = injector
        .push(FrameBuffer::borrowed(info, &data).unwrap())
        .unwrap_err();
    assert!(matches!(err, RelayError::Flow(FlowError::NotPlaying)));
    assert!(started.elapsed() < Duration::from_millis(500));
    graph.teardown();
}

#[test]
fn injected_frames_arrive_in_order_with_their_own_bytes() {
    let engine = LocalEngine::new();
    let graph = build(&engine, "appsrc format=GRAY8 width=8 height=8 ! appsink max-buffers=64");
    let mut injector = graph.injector().unwrap();
    let mut exchange = graph.pull_exchange().unwrap();
    graph.set_state(State::Playing).unwrap();

    let info = FrameInfo::packed(8, 8, PixelFormat::Gray8);
    let count = 32u8;
    let mut scratch = vec![0u8; info.size()];
    for i in 0..count {
        // The same scratch buffer is reused; each push must keep its own copy.
        scratch.fill(i);
        injector
            .push(FrameBuffer::borrowed(info, &scratch).unwrap())
            .unwrap();
    }
    injector.end_of_stream();

    let mut seen = 0u8;
    loop {
        match exchange.pull(PULL_TIMEOUT).unwrap() {
            Pulled::Frame(guard) => {
                let frame = guard.frame();
                assert!(frame.data()[..info.size()].iter().all(|b| *b == seen));
                seen += 1;
            }
            Pulled::EndOfStream => break,
            Pulled::Timeout => panic!("timed out after {seen} frames"),
        }
    }
    assert_eq!(seen, count);
    assert_eq!(injector.pushed(), u64::from(count));
    graph.teardown();
}

#[test]
fn mismatched_injected_frame_is_rejected() {
    let engine = LocalEngine::new();
    let graph = build(&engine, "appsrc format=RGB width=4 height=4 ! appsink");
    let mut injector = graph.injector().unwrap();
    graph.set_state(State::Playing).unwrap();

    let info = FrameInfo::packed(8, 4, PixelFormat::Rgb);
    let data = vec![0u8; info.size()];
    let err = injector
        .push(FrameBuffer::borrowed(info, &data).unwrap())
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidFrame(_)));
    graph.teardown();
}

#[test]
fn callback_runs_on_one_thread_in_order() {
    let engine = LocalEngine::new();
    let graph = build(&engine, "testsrc num-buffers=25 width=8 height=8 ! appsink");

    let delivered = Arc::new(AtomicU64::new(0));
    let threads = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let callback = {
        let delivered = delivered.clone();
        let threads = threads.clone();
        let mut last = None;
        graph
            .connect_frames(move |frame: &FrameBuffer<'_>| {
                assert!(last.is_none_or(|prev| prev < frame.sequence()));
                last = Some(frame.sequence());
                threads.lock().push(thread::current().id());
                delivered.fetch_add(1, Ordering::SeqCst);
                Flow::Continue
            })
            .unwrap()
    };

    let events = EventLoop::new();
    events.watch(&graph);
    graph.set_state(State::Playing).unwrap();
    let exit = events.run_for(Duration::from_secs(10));
    callback.join();

    assert_eq!(exit.reason, ExitReason::Idle);
    assert_eq!(delivered.load(Ordering::SeqCst), 25);
    let threads = threads.lock();
    assert!(threads.iter().all(|id| *id == threads[0]));
    assert_ne!(threads[0], thread::current().id());
}

#[test]
fn callback_stop_ends_the_stream() {
    let engine = LocalEngine::new();
    let graph = build(&engine, "testsrc is-live=true framerate=100 width=8 height=8 ! appsink");
    let stops_at = 3;
    let callback = graph
        .connect_frames(move |frame: &FrameBuffer<'_>| {
            if frame.sequence() + 1 >= stops_at {
                Flow::Stop
            } else {
                Flow::Continue
            }
        })
        .unwrap();

    let events = EventLoop::new();
    events.watch(&graph);
    graph.set_state(State::Playing).unwrap();
    let exit = events.run_for(Duration::from_secs(10));

    assert_eq!(exit.reason, ExitReason::Idle);
    assert!(exit.errors.is_empty());
    assert!(graph.is_torn_down());
    assert!(callback.delivered() >= stops_at);
}

#[test]
fn stage_error_surfaces_through_pull() {
    let engine = LocalEngine::new();
    let graph = build(
        &engine,
        "testsrc width=8 height=8 ! identity name=tap error-after=3 ! appsink",
    );
    let mut exchange = graph.pull_exchange().unwrap();
    graph.set_state(State::Playing).unwrap();

    let mut frames = 0;
    let err = loop {
        match exchange.pull(PULL_TIMEOUT) {
            Ok(Pulled::Frame(_)) => frames += 1,
            Ok(other) => panic!("expected an error, got {other:?}"),
            Err(e) => break e,
        }
    };
    assert!(frames < 3);
    assert!(matches!(err, RelayError::Engine { stage: Some(ref s), .. } if s == "tap"));
    graph.teardown();
}

#[test]
fn event_loop_reports_errors_and_stops_other_graphs_cleanly() {
    let engine = LocalEngine::new();
    let failing = build(&engine, "testsrc width=8 height=8 ! identity error-after=1 ! fakesink");
    let finishing = build(&engine, "testsrc num-buffers=5 width=8 height=8 ! fakesink");

    let events = EventLoop::new();
    events.watch(&failing);
    events.watch(&finishing);
    failing.set_state(State::Playing).unwrap();
    finishing.set_state(State::Playing).unwrap();

    let exit = events.run_for(Duration::from_secs(10));
    assert_eq!(exit.reason, ExitReason::Idle);
    assert_eq!(exit.errors.len(), 1);
    assert!(failing.is_torn_down());
    assert!(finishing.is_torn_down());
    assert_eq!(engine.live_elements(), 0);
}

#[test]
fn description_round_trips_through_a_built_graph() {
    let engine = LocalEngine::new();
    let text = "testsrc name=cam num-buffers=3 width=32 height=16 ! videoconvert format=BGRA ! appsink name=out";
    let graph = build(&engine, text);

    let described = graph.description().unwrap();
    let reparsed: Description = described.to_string().parse().unwrap();
    assert_eq!(described, reparsed);
    assert_eq!(graph.stage_names(), vec!["cam", "videoconvert1", "out"]);

    let rebuilt = PipelineGraph::build(&engine, &reparsed.stages, GraphConfig::default()).unwrap();
    assert_eq!(rebuilt.stage_names(), graph.stage_names());
    graph.teardown();
    rebuilt.teardown();
}

#[test]
fn quoted_stage_names_round_trip() {
    let engine = LocalEngine::new();
    let graph = build(&engine, r#"testsrc name="front cam" ! appsink name="out ! 1""#);

    let text = graph.description().unwrap().to_string();
    let rebuilt = PipelineGraph::from_description(&engine, &text, GraphConfig::default())
        .unwrap_or_else(|e| panic!("'{text}' did not rebuild: {e}"));
    assert_eq!(rebuilt.stage_names(), vec!["front cam", "out ! 1"]);
    assert_eq!(rebuilt.description().unwrap(), graph.description().unwrap());
    graph.teardown();
    rebuilt.teardown();
}

#[test]
fn state_changes_walk_every_intermediate_state() {
    let engine = LocalEngine::new();
    let graph = build(&engine, "testsrc width=8 height=8 ! fakesink");
    let events = EventLoop::persistent();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        events.on_message(move |_, message| {
            if let relay::Message::StateChanged { old, new } = message {
                seen.lock().push((*old, *new));
            }
        });
    }
    events.watch(&graph);

    graph.set_state(State::Playing).unwrap();
    graph.set_state(State::Null).unwrap();
    assert_eq!(graph.state(), State::Null);
    events.run_for(Duration::from_millis(100));

    use State::*;
    assert_eq!(
        *seen.lock(),
        vec![
            (Null, Ready),
            (Ready, Paused),
            (Paused, Playing),
            (Playing, Paused),
            (Paused, Ready),
            (Ready, Null),
        ]
    );
    graph.teardown();
}
