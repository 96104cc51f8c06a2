//! Measurement agent: wire protocol, HTTP server and the scheduler-side proxy.

pub mod api;
pub mod client;
pub mod server;
