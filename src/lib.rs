//! mux-echo: a single-threaded, readiness-driven TCP server.
//!
//! One event loop multiplexes every client connection over mio (epoll on
//! Linux, kqueue on macOS). Clients send length-prefixed frames of up to 256
//! bytes; each request is answered with a fixed acknowledgement frame.
//!
//! Features:
//! - Edge-triggered, non-blocking reads and writes with partial-I/O handling
//! - Pipelined and fragmented request framing
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod runtime;

pub use config::Config;
pub use runtime::{Server, ServerHandle};
