//! Streaming feed modules.
//!
//! - `client`: host-facing entry point, options, and the running-stream handle.
//! - `supervisor`: reconnect loop with per-class backoff.
//! - `session`: one connection attempt from request to close.
//! - `transport`: HTTP seam that opens the request and yields body chunks.
//! - `frame`: CRLF framing of the chunked body into messages.
//! - `listener`: ordered message callbacks with failure isolation.
//! - `proto`: messages, control markers, and filter parameters.

/// Stream client, options, and handle.
pub mod client;
/// CRLF frame assembly.
pub mod frame;
/// Message listener registry.
pub mod listener;
/// Feed messages and filter parameters.
pub mod proto;
/// Single connection attempt.
pub mod session;
/// Reconnect supervisor and status events.
pub mod supervisor;
/// HTTP transport seam.
pub mod transport;
