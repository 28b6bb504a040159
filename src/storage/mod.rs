//! Persistence for recurring series and generated documents
//!
//! SQLite holds both tables. Everything above this module talks to the
//! [`SeriesRepository`] trait so tests can swap in the in-memory mock.

pub mod repository;

pub use repository::{
    create_mock_repository, create_sqlite_repository, ClaimOutcome, MockSeriesRepository,
    SeriesFilter, SeriesMutation, SeriesRepository, SharedSeriesRepository,
    SqliteSeriesRepository,
};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Open the repository described by the database configuration
pub fn open_repository(config: &DatabaseConfig) -> Result<SharedSeriesRepository> {
    create_sqlite_repository(&config.sqlite_path)
}
