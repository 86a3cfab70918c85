//! Error types for the relay library.

use std::fmt;

use crate::graph::State;

/// Errors that can occur while building, driving or serving pipelines.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Build time**: [`Configuration`](Self::Configuration) covers unknown
///   stage types, missing properties and incompatible neighbours. Fatal to
///   that graph only.
/// - **Server**: [`Bind`](Self::Bind) means the mount or port is
///   unavailable. Fatal to that mount only.
/// - **Run time**: [`Flow`](Self::Flow) is recoverable (retry or drop the
///   frame); [`Engine`](Self::Engine) is fatal to the owning graph and is
///   always reported through the [`EventLoop`](crate::EventLoop).
/// - **Lifecycle**: [`StateChange`](Self::StateChange),
///   [`StageLocked`](Self::StageLocked), [`TornDown`](Self::TornDown).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stage spec could not be turned into a linked stage.
    #[error("configuration error in stage {stage}: {reason}")]
    Configuration { stage: String, reason: String },

    /// A mount could not be registered (port in use, description invalid).
    #[error("bind error on {target}: {reason}")]
    Bind { target: String, reason: String },

    /// A frame was rejected by the graph.
    #[error("flow error: {0}")]
    Flow(FlowError),

    /// Asynchronous failure reported by the media engine.
    #[error("engine error in {}: {message}", stage.as_deref().unwrap_or("pipeline"))]
    Engine {
        stage: Option<String>,
        message: String,
    },

    /// Frame metadata does not describe the data it carries.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The engine refused a lifecycle transition.
    #[error("state change {from:?} -> {to:?} failed")]
    StateChange { from: State, to: State },

    /// Properties can only change before the graph reaches PLAYING.
    #[error("stage {0} cannot be reconfigured while playing")]
    StageLocked(String),

    /// Pull and push delivery are mutually exclusive on one sink.
    #[error("frame exchange already claimed: {0}")]
    ExchangeClaimed(&'static str),

    /// The graph has already been torn down.
    #[error("graph has been torn down")]
    TornDown,

    /// No mount registered at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// No session with the given ID exists.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Failed to parse a client control request.
    #[error("control request parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

impl RelayError {
    pub(crate) fn config(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the operation that produced this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Flow(FlowError::Full) | Self::Flow(FlowError::NotPlaying)
        )
    }
}

/// Why a frame push was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// The graph is not in the PLAYING state.
    NotPlaying,
    /// Downstream did not accept the frame within the push timeout.
    Full,
    /// End-of-stream was already signalled on this source.
    EndOfStream,
    /// The graph is shutting down.
    Flushing,
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPlaying => write!(f, "graph is not playing"),
            Self::Full => write!(f, "downstream is full"),
            Self::EndOfStream => write!(f, "source already at end of stream"),
            Self::Flushing => write!(f, "graph is flushing"),
        }
    }
}

/// Specific kind of control request parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
