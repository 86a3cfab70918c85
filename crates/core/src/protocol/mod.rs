//! Control protocol spoken on a session server connection.
//!
//! Requests follow the RTSP/1.0 text syntax: a request line, headers and a
//! blank line.
//!
//! ```text
//! PLAY rtsp://server:8554/test RTSP/1.0\r\n
//! CSeq: 2\r\n
//! \r\n
//! ```
//!
//! ## Supported methods
//!
//! | Method | Purpose |
//! |--------|---------|
//! | OPTIONS | Capability discovery |
//! | DESCRIBE | Return the mount's pipeline description |
//! | PLAY | Create a session and start frame delivery |
//! | TEARDOWN | End the session |
//! | GET_PARAMETER | Keepalive |
//!
//! Frames follow a `PLAY` response on the same connection, see
//! [`transport::framing`](crate::transport::framing).

pub mod handler;
pub mod request;
pub mod response;

pub use handler::MethodHandler;
pub use request::Request;
pub use response::Response;
