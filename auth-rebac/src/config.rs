use serde::{Deserialize, Serialize};

/// Tunables for the engine. The defaults are safe for production use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebacConfig {
    /// Capacity of the channel feeding the relation index worker. Producers
    /// back off (async) once this many batches are in flight.
    pub queue_capacity: usize,

    /// Number of rows fetched per page when backfilling legacy records.
    pub migration_page_size: u64,
}

impl Default for RebacConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            migration_page_size: 100,
        }
    }
}
