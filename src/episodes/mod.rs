//! Evidence episodes: the ingestion boundary and the per-entity timeline clusterer.

pub mod clusterer;
pub mod ingest;

pub use clusterer::EpisodeClusterer;
pub use ingest::{ingest_episodes, EpisodeRecord, IngestReport, IngestionQueue};
