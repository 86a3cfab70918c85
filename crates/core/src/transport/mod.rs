//! Network transport for the session server.
//!
//! - [`tcp`]: one accept loop per bound port and a thread per client
//!   connection carrying the control handshake.
//! - [`framing`]: the interleaved packet format frames travel in once a
//!   session plays.

pub mod framing;
pub(crate) mod tcp;

pub use framing::{WireFrame, read_frame, write_frame};
