//! sidebar-daemon library: exposes the daemon components for testing.
//!
//! This is a thin layer over `sidebar-core` that adds the HTTP backend,
//! the SSE patch stream client, configuration and the local preferences
//! cache.

pub mod config;
pub mod daemon;
pub mod http;
pub mod persistence;
pub mod sse;
pub mod stream;

pub use config::{Config, ReconnectConfig};
pub use daemon::Daemon;
pub use http::HttpBackend;
pub use persistence::PrefsStorage;
pub use sse::{SseEvent, SseParser};
pub use stream::{PatchStream, StreamEvent, StreamSource};
