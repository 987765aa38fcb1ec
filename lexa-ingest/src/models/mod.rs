//! Data models for lexa-ingest

pub mod job;
pub mod unit;

pub use job::{ChunkTally, Job, JobMetadata, SourceReference};
pub use unit::{Unit, WordOccurrence};
