use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use crate::error::{RelayError, Result};
use crate::exchange::{Flow, FrameCallback};
use crate::frame::FrameBuffer;
use crate::graph::{PipelineGraph, State};
use crate::server::ServerContext;

/// Path used when a request URI carries none.
pub const ROOT_MOUNT_PATH: &str = "/";

/// How sessions on one mount relate to graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountPolicy {
    /// Every session gets its own graph built from the mount description.
    #[default]
    Exclusive,
    /// All sessions read from one graph, started by the first subscriber
    /// and torn down when the last one leaves.
    Shared,
}

/// How a shared mount hands one frame to several subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanoutPolicy {
    /// Each subscriber receives its own deep copy.
    #[default]
    Copy,
    /// One copy is made per frame and subscribers share it read-only.
    Shared,
}

type Subscribers = Arc<Mutex<HashMap<String, Sender<FrameBuffer<'static>>>>>;

struct SharedFeed {
    graph: PipelineGraph,
    subscribers: Subscribers,
    _callback: FrameCallback,
}

/// A named endpoint bound to a pipeline description.
pub struct Mount {
    path: String,
    description: String,
    policy: MountPolicy,
    feed: Mutex<Option<SharedFeed>>,
}

impl Mount {
    pub fn new(path: &str, description: &str, policy: MountPolicy) -> Self {
        Self {
            path: path.to_string(),
            description: description.to_string(),
            policy,
            feed: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn policy(&self) -> MountPolicy {
        self.policy
    }

    /// Build a fresh graph from this mount's description.
    pub(crate) fn instantiate(&self, ctx: &ServerContext) -> Result<PipelineGraph> {
        PipelineGraph::from_description(&*ctx.engine, &self.description, ctx.config.graph.clone())
    }

    /// Add a subscriber to the shared graph, starting it if needed.
    pub(crate) fn join_feed(
        &self,
        ctx: &ServerContext,
        session_id: &str,
    ) -> Result<(PipelineGraph, Receiver<FrameBuffer<'static>>)> {
        let mut slot = self.feed.lock();
        let feed = match slot.take().filter(|f| !f.graph.is_torn_down()) {
            Some(feed) => feed,
            None => self.start_feed(ctx)?,
        };

        let (tx, rx) = crossbeam_channel::bounded(ctx.config.fanout_depth.max(1));
        let total = {
            let mut subscribers = feed.subscribers.lock();
            subscribers.insert(session_id.to_string(), tx);
            subscribers.len()
        };
        tracing::debug!(mount = %self.path, session_id, subscribers = total, "joined shared feed");

        let graph = feed.graph.clone();
        *slot = Some(feed);
        Ok((graph, rx))
    }

    /// Drop a subscriber; the last one out stops the shared graph.
    pub(crate) fn leave_feed(&self, session_id: &str) {
        let mut slot = self.feed.lock();
        let empty = slot.as_ref().is_some_and(|feed| {
            let mut subscribers = feed.subscribers.lock();
            subscribers.remove(session_id);
            subscribers.is_empty()
        });
        if empty && let Some(feed) = slot.take() {
            feed.graph.teardown();
            tracing::info!(mount = %self.path, graph = %feed.graph.id(), "shared feed stopped");
        }
    }

    pub(crate) fn close_feed(&self) {
        if let Some(feed) = self.feed.lock().take() {
            feed.graph.teardown();
        }
    }

    fn start_feed(&self, ctx: &ServerContext) -> Result<SharedFeed> {
        let graph = self.instantiate(ctx)?;
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let callback = graph.connect_frames(fan_out(subscribers.clone(), ctx.config.fanout))?;
        ctx.events.watch(&graph);
        if let Err(e) = graph.set_state(State::Playing) {
            graph.teardown();
            return Err(e);
        }
        tracing::info!(mount = %self.path, graph = %graph.id(), fanout = ?ctx.config.fanout, "shared feed started");
        Ok(SharedFeed {
            graph,
            subscribers,
            _callback: callback,
        })
    }
}

/// Frame callback that hands every frame to each subscriber's queue.
///
/// A subscriber whose queue is full misses the frame; the others are not
/// held back.
fn fan_out(
    subscribers: Subscribers,
    policy: FanoutPolicy,
) -> impl FnMut(&FrameBuffer<'_>) -> Flow + Send + 'static {
    move |frame| {
        let subscribers = subscribers.lock();
        let shared = (policy == FanoutPolicy::Shared).then(|| frame.to_owned_copy());
        for (session_id, tx) in subscribers.iter() {
            let copy = match &shared {
                Some(frame) => frame.clone(),
                None => frame.to_owned_copy(),
            };
            if let Err(TrySendError::Full(_)) = tx.try_send(copy) {
                tracing::trace!(session_id = %session_id, sequence = frame.sequence(), "subscriber lagging, frame dropped");
            }
        }
        Flow::Continue
    }
}

/// Mounts served on one port, keyed by path.
#[derive(Clone, Default)]
pub struct MountRegistry {
    mounts: Arc<RwLock<HashMap<String, Arc<Mount>>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mount. A path can only be bound once per port.
    pub fn add(&self, mount: Mount) -> Result<Arc<Mount>> {
        let mut mounts = self.mounts.write();
        if mounts.contains_key(mount.path()) {
            return Err(RelayError::Bind {
                target: mount.path().to_string(),
                reason: "mount already bound on this port".to_string(),
            });
        }
        let mount = Arc::new(mount);
        mounts.insert(mount.path().to_string(), mount.clone());
        tracing::info!(path = %mount.path(), policy = ?mount.policy(), "mount registered");
        Ok(mount)
    }

    pub fn get(&self, path: &str) -> Option<Arc<Mount>> {
        self.mounts.read().get(path).cloned()
    }

    /// Resolve the mount a request URI addresses.
    pub fn resolve_from_uri(&self, uri: &str) -> Result<Arc<Mount>> {
        let path = extract_mount_path(uri);
        self.get(path)
            .ok_or_else(|| RelayError::MountNotFound(path.to_string()))
    }

    pub fn all(&self) -> Vec<Arc<Mount>> {
        self.mounts.read().values().cloned().collect()
    }
}

/// Extract the mount path from a request URI.
///
/// `rtsp://host:8554/test/track1` → `/test`
/// `rtsp://host:8554/test`        → `/test`
/// `rtsp://host:8554`             → `/`
/// `/camera1`                     → `/camera1`
pub fn extract_mount_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        after.find('/').map_or(ROOT_MOUNT_PATH, |slash| &after[slash..])
    } else if uri.starts_with('/') {
        uri
    } else {
        ROOT_MOUNT_PATH
    };

    let path = path.split(['?', '#']).next().unwrap_or(path);
    let path = match path.rfind("/track") {
        Some(pos) if pos > 0 => &path[..pos],
        _ => path,
    };
    match path.trim_end_matches('/') {
        "" => ROOT_MOUNT_PATH,
        trimmed => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_path_full_uri() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554/test"), "/test");
    }

    #[test]
    fn extract_path_with_track() {
        assert_eq!(
            extract_mount_path("rtsp://10.0.0.1:8554/camera1/track1"),
            "/camera1"
        );
    }

    #[test]
    fn extract_path_edge_cases() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554"), "/");
        assert_eq!(extract_mount_path("rtsp://localhost:8554/"), "/");
        assert_eq!(extract_mount_path("*"), "/");
        assert_eq!(extract_mount_path("/camera1/"), "/camera1");
        assert_eq!(extract_mount_path("rtsp://h/live?token=1"), "/live");
    }

    #[test]
    fn registry_rejects_duplicate_path() {
        let registry = MountRegistry::new();
        registry
            .add(Mount::new("/test", "testsrc ! appsink", MountPolicy::Exclusive))
            .unwrap();
        let err = registry
            .add(Mount::new("/test", "testsrc ! appsink", MountPolicy::Shared))
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Bind { .. }));
    }

    #[test]
    fn registry_resolves_without_fallback() {
        let registry = MountRegistry::new();
        registry
            .add(Mount::new("/test", "testsrc ! appsink", MountPolicy::Exclusive))
            .unwrap();
        assert!(registry.resolve_from_uri("rtsp://localhost:8554/test/track1").is_ok());
        assert!(matches!(
            registry.resolve_from_uri("rtsp://localhost:8554/other"),
            Err(RelayError::MountNotFound(path)) if path == "/other"
        ));
    }

    #[test]
    fn fan_out_copies_per_subscriber() {
        use crate::format::PixelFormat;
        use crate::frame::FrameInfo;

        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (tx1, rx1) = crossbeam_channel::bounded(1);
        let (tx2, rx2) = crossbeam_channel::bounded(1);
        subscribers.lock().insert("a".into(), tx1);
        subscribers.lock().insert("b".into(), tx2);

        let mut deliver = fan_out(subscribers, FanoutPolicy::Copy);
        let info = FrameInfo::packed(2, 1, PixelFormat::Gray8);
        let data = [1u8, 2];
        let frame = FrameBuffer::borrowed(info, &data).unwrap();
        assert_eq!(deliver(&frame), Flow::Continue);
        // Queues are full now; the second frame is dropped, not blocked on.
        assert_eq!(deliver(&frame), Flow::Continue);

        let a = rx1.try_recv().unwrap();
        let b = rx2.try_recv().unwrap();
        assert_eq!(a.data(), &data);
        assert_ne!(a.data().as_ptr(), b.data().as_ptr());
        assert!(rx1.try_recv().is_err());
    }
}
