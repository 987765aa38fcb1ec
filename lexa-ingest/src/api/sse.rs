//! Server-Sent Events for job progress
//!
//! `GET /jobs/events` streams job lifecycle, chunk commits and circuit
//! transitions. `?job_id=` narrows the stream to one job.

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub job_id: Option<Uuid>,
}

/// GET /jobs/events
pub async fn job_event_stream(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let wanted = filter.job_id;
    lexa_common::sse::event_bus_stream(&state.event_bus, "lexa-ingest", move |event| match wanted {
        Some(id) => event.job_id() == Some(id),
        None => true,
    })
}
