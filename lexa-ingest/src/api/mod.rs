//! HTTP API handlers for lexa-ingest
//!
//! REST for job control, SSE for progress.

pub mod caller;
pub mod health;
pub mod jobs;
pub mod sse;

pub use caller::{CallerId, CALLER_ID_HEADER};
pub use health::health_routes;
pub use jobs::job_routes;
pub use sse::job_event_stream;
