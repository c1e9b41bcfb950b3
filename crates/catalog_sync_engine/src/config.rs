//! Configuration for the sync engine.

use catalog_content::Space;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one (context, consumer) sync.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Catalog context name.
    pub context: String,
    /// Consumer name within the context.
    pub consumer: String,
    /// Base URL of the catalog API.
    pub api_url: String,
    /// Space that mirrored content is written into.
    pub space: Space,
    /// Maximum resources per bulk write during snapshot loading.
    pub bulk_batch_size: usize,
    /// Request timeout for feed and consumer calls.
    pub request_timeout: Duration,
    /// Optional deadline for snapshot download and extraction.
    pub snapshot_deadline: Option<Duration>,
    /// Directory for snapshot scratch files. Defaults to the system temp dir.
    pub work_dir: Option<PathBuf>,
    /// Registration fan-out configuration.
    pub registration: RegistrationConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(
        context: impl Into<String>,
        consumer: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            consumer: consumer.into(),
            api_url: api_url.into(),
            space: Space::Standard,
            bulk_batch_size: 999,
            request_timeout: Duration::from_secs(30),
            snapshot_deadline: None,
            work_dir: None,
            registration: RegistrationConfig::default(),
        }
    }

    /// Sets the space mirrored content is written into.
    pub fn with_space(mut self, space: Space) -> Self {
        self.space = space;
        self
    }

    /// Sets the bulk write batch size. Zero is treated as one.
    pub fn with_bulk_batch_size(mut self, size: usize) -> Self {
        self.bulk_batch_size = size.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the snapshot deadline.
    pub fn with_snapshot_deadline(mut self, deadline: Duration) -> Self {
        self.snapshot_deadline = Some(deadline);
        self
    }

    /// Sets the directory that snapshot scratch files are created in.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Sets the registration configuration.
    pub fn with_registration(mut self, registration: RegistrationConfig) -> Self {
        self.registration = registration;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "", "")
    }
}

/// Configuration for bounded-parallel registration fan-out.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Maximum requests in flight.
    pub max_concurrency: usize,
    /// Timeout for a single request.
    pub item_timeout: Duration,
    /// Deadline for a whole batch.
    pub batch_timeout: Duration,
}

impl RegistrationConfig {
    /// Creates a configuration with the given concurrency.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            item_timeout: Duration::from_secs(10),
            batch_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the per-request timeout.
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    /// Sets the batch deadline.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("rules", "rules_consumer", "https://cti.example.com/api/v1")
            .with_space(Space::Custom)
            .with_bulk_batch_size(0)
            .with_request_timeout(Duration::from_secs(5))
            .with_snapshot_deadline(Duration::from_secs(120));

        assert_eq!(config.context, "rules");
        assert_eq!(config.consumer, "rules_consumer");
        assert_eq!(config.space, Space::Custom);
        assert_eq!(config.bulk_batch_size, 1);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.snapshot_deadline, Some(Duration::from_secs(120)));
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.space, Space::Standard);
        assert_eq!(config.bulk_batch_size, 999);
        assert_eq!(config.snapshot_deadline, None);

        let registration = RegistrationConfig::new(0);
        assert_eq!(registration.max_concurrency, 1);
        assert_eq!(registration.batch_timeout, Duration::from_secs(60));
    }
}
