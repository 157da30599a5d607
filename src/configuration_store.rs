//! Thread-safe in-memory storage for the currently active configuration.
use std::sync::{Arc, PoisonError, RwLock};

use crate::configuration::FlaggerConfiguration;

/// `ConfigurationStore` provides a thread-safe (`Sync`) storage for flagger configuration that
/// allows concurrent access for readers and writers.
///
/// Configuration is never mutated in place: writers swap in a new snapshot and readers keep
/// whatever `Arc` they obtained, so nobody observes a partially-updated configuration.
#[derive(Default)]
pub struct ConfigurationStore {
    configuration: RwLock<Option<Arc<FlaggerConfiguration>>>,
}

impl ConfigurationStore {
    /// Create a new empty configuration store.
    pub fn new() -> Self {
        ConfigurationStore::default()
    }

    /// Get currently-active configuration. Returns `None` if no configuration has been stored
    /// yet.
    pub fn get_configuration(&self) -> Option<Arc<FlaggerConfiguration>> {
        // A poisoned lock still holds a complete snapshot (writes are a single assignment).
        let configuration = self
            .configuration
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        configuration.clone()
    }

    /// Set new configuration, returning the previous one.
    pub fn set_configuration(
        &self,
        config: Arc<FlaggerConfiguration>,
    ) -> Option<Arc<FlaggerConfiguration>> {
        let mut configuration_slot = self
            .configuration
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        configuration_slot.replace(config)
    }

    /// Install `config` unless it is structurally equal to the active configuration. Returns the
    /// installed snapshot, or `None` if the configuration did not change.
    pub fn update_configuration(
        &self,
        config: FlaggerConfiguration,
    ) -> Option<Arc<FlaggerConfiguration>> {
        let mut configuration_slot = self
            .configuration
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if configuration_slot.as_deref() == Some(&config) {
            return None;
        }
        let config = Arc::new(config);
        *configuration_slot = Some(Arc::clone(&config));
        Some(config)
    }
}
