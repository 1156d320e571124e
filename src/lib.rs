//! Client for long-lived chunked HTTP JSON streaming feeds.
//!
//! The crate is organized by concern:
//! - `stream`: supervised streaming connection, framing, and listeners.
//! - `auth`: request signing (OAuth 1.0a).
//! - `retry`: failure classes, reconnect backoff, and timeout helpers.

/// Request signing.
pub mod auth;
/// Failure classification and backoff helpers used across the SDK.
pub mod retry;
/// Streaming client, protocol types, and session helpers.
pub mod stream;
