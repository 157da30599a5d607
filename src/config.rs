use std::time::Duration;

use crate::{
    ingestion::{IngestionBatcherConfig, SdkInfo},
    retry_queue::RetryQueue,
    Flagger, Transport,
};

/// Configuration for [`Flagger`].
#[derive(Debug, Clone)]
pub struct FlaggerConfig {
    pub(crate) ingestion_url: String,
    pub(crate) sdk_info: SdkInfo,
    pub(crate) max_calls: usize,
    pub(crate) interval: Duration,
    pub(crate) first_exposures_threshold: usize,
    pub(crate) max_retry_memory: usize,
    pub(crate) apply_server_batching: bool,
}

impl FlaggerConfig {
    /// Default URL that ingestion payloads are sent to. The API key is appended to it.
    pub const DEFAULT_INGESTION_URL: &'static str = "https://ingestion.airdeploy.io/v3/ingest/";
    /// Default number of calls after which a batch is flushed.
    pub const DEFAULT_MAX_CALLS: usize = IngestionBatcherConfig::DEFAULT_MAX_CALLS;
    /// Default time between timer-driven flushes.
    pub const DEFAULT_INTERVAL: Duration = IngestionBatcherConfig::DEFAULT_INTERVAL;
    /// Default number of first exposures flushed immediately.
    pub const DEFAULT_FIRST_EXPOSURES_THRESHOLD: usize =
        IngestionBatcherConfig::DEFAULT_FIRST_EXPOSURES_THRESHOLD;
    /// Default retry queue memory budget in bytes.
    pub const DEFAULT_MAX_RETRY_MEMORY: usize = RetryQueue::DEFAULT_MAX_MEMORY_SIZE;

    /// Create a configuration sending ingestion payloads to `ingestion_url`.
    ///
    /// ```
    /// # use flagger::FlaggerConfig;
    /// FlaggerConfig::new("http://localhost:8080/ingest");
    /// ```
    pub fn new(ingestion_url: impl Into<String>) -> Self {
        FlaggerConfig {
            ingestion_url: ingestion_url.into(),
            sdk_info: SdkInfo::default(),
            max_calls: FlaggerConfig::DEFAULT_MAX_CALLS,
            interval: FlaggerConfig::DEFAULT_INTERVAL,
            first_exposures_threshold: FlaggerConfig::DEFAULT_FIRST_EXPOSURES_THRESHOLD,
            max_retry_memory: FlaggerConfig::DEFAULT_MAX_RETRY_MEMORY,
            apply_server_batching: true,
        }
    }

    /// Create a default configuration for the hosted ingestion service.
    ///
    /// ```
    /// # use flagger::FlaggerConfig;
    /// let config = FlaggerConfig::from_api_key("api-key");
    /// assert_eq!(config.ingestion_url(), "https://ingestion.airdeploy.io/v3/ingest/api-key");
    /// ```
    pub fn from_api_key(api_key: impl AsRef<str>) -> Self {
        FlaggerConfig::new(format!(
            "{}{}",
            FlaggerConfig::DEFAULT_INGESTION_URL,
            api_key.as_ref()
        ))
    }

    /// Preset for short-lived, latency-sensitive processes: no immediate first-exposure flushes
    /// and a 250ms flush interval. Batching parameters sent by the server are ignored so that the
    /// preset stays in effect.
    pub fn for_browser_like(self) -> Self {
        self.with_first_exposures_threshold(0)
            .with_interval(Duration::from_millis(250))
            .with_server_batching(false)
    }

    pub fn ingestion_url(&self) -> &str {
        &self.ingestion_url
    }

    /// Override the SDK name and version reported with every batch.
    pub fn with_sdk_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.sdk_info = SdkInfo {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    pub fn with_max_calls(mut self, max_calls: usize) -> Self {
        self.max_calls = max_calls;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Number of first exposures that are flushed as soon as they are reported. `0` disables it.
    pub fn with_first_exposures_threshold(mut self, threshold: usize) -> Self {
        self.first_exposures_threshold = threshold;
        self
    }

    pub fn with_max_retry_memory(mut self, bytes: usize) -> Self {
        self.max_retry_memory = bytes;
        self
    }

    /// Whether the `sdkConfig` batching parameters of received configurations override the max
    /// calls and interval set here. Enabled by default.
    pub fn with_server_batching(mut self, enabled: bool) -> Self {
        self.apply_server_batching = enabled;
        self
    }

    /// Create a new [`Flagger`] using this configuration.
    pub fn to_flagger<T: Transport>(self, transport: T) -> Flagger<T> {
        Flagger::new(self, transport)
    }

    pub(crate) fn batcher_config(&self) -> IngestionBatcherConfig {
        IngestionBatcherConfig::new(self.ingestion_url.clone())
            .with_sdk_info(self.sdk_info.clone())
            .with_max_calls(self.max_calls)
            .with_interval(self.interval)
            .with_first_exposures_threshold(self.first_exposures_threshold)
            .with_max_retry_memory(self.max_retry_memory)
    }
}
