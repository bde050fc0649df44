//! The `<EOF>` echo protocol.
//!
//! A client sends arbitrary single-byte text terminated by the literal
//! marker `<EOF>`. The server answers with the content preceding the marker,
//! every `Client` rewritten to `Server`, then shuts the connection down.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  Hello from Client<EOF>
//! Response: Hello from Server
//! ```
//!
//! There is no length prefix and no pipelining: one frame per connection.
//! Bytes that arrive after the first marker are discarded.

pub mod frame;

pub use frame::{transform, FrameAccumulator, FrameError};

/// End-of-frame marker.
pub const MARKER_STR: &str = "<EOF>";

/// [`MARKER_STR`] as raw bytes.
pub const MARKER: &[u8] = MARKER_STR.as_bytes();

/// Token rewritten in replies.
pub const CLIENT_TOKEN: &str = "Client";

/// Replacement for [`CLIENT_TOKEN`].
pub const SERVER_TOKEN: &str = "Server";

/// Default cap on a frame's size, marker included.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
