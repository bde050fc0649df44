//! Connection serving.
//!
//! - `listener`: binds the socket and runs the accept loop
//! - `handler`: per-connection state machine
//! - `ready`: readiness signal for confirmed handoff

pub mod handler;
pub mod listener;
pub mod ready;

pub use handler::{
    handle_connection, ConnectionHandler, ConnectionId, HandlerError, HandlerOutcome,
    HandlerSettings, HandlerState,
};
pub use listener::{Listener, ServerError};
pub use ready::ReadySignal;
