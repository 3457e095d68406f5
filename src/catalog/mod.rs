mod credentials;
mod jobs;
mod runs;

use sqlx::{Pool, Postgres};

pub use credentials::Credential;
pub use jobs::JobConfig;
pub(crate) use jobs::validate_identifier;
pub use runs::{CheckpointUpdate, Run, RunStatus};

/// Catalog of jobs, runs, and credentials backed by Postgres.
///
/// Owns all durable engine state; executors and the orchestrator only ever
/// hold transient views. Every method is transactional at the call boundary.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    pub(crate) pool: Pool<Postgres>,
}

impl CatalogStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}
