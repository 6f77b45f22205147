//! HTTP API handlers for hcat-ingest
//!
//! REST for the pipeline operations, SSE for progress.

pub mod health;
pub mod jobs;
pub mod sessions;
pub mod sse;

pub use health::health_routes;
pub use jobs::job_routes;
pub use sessions::session_routes;
pub use sse::event_stream;
