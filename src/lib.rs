//! eof-echo: a concurrent `<EOF>`-delimited echo server.
//!
//! Each client sends one message terminated by `<EOF>`. The server replies
//! with the message, `Client` rewritten to `Server`, and closes the
//! connection. Every connection runs on its own task, so one slow client
//! never delays another.

pub mod config;
pub mod protocol;
pub mod server;
