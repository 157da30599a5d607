use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

use crate::{
    configuration::{FlaggerConfiguration, Payload},
    configuration_store::ConfigurationStore,
    entity::{Attributes, Entity},
    eval::{evaluate, EvaluationResult},
    ingestion::{Event, IngestionBatcher, IngestionData},
    FlaggerConfig, Result, Transport,
};

/// Handle returned by [`Flagger::add_config_update_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ConfigUpdateListener = Arc<dyn Fn(&FlaggerConfiguration) + Send + Sync>;

/// Feature flag client: evaluates flags against the current configuration and reports usage.
///
/// All methods take `&self`; share the client between threads with an `Arc`.
///
/// # Examples
/// ```
/// # use flagger::{Entity, Error, FlaggerConfig};
/// let flagger = FlaggerConfig::from_api_key("api-key")
///     .to_flagger(|_url: String, _body: String| async { Ok::<(), Error>(()) });
///
/// // Without a configuration every flag is off.
/// assert!(!flagger.is_enabled("new-checkout", Some(&Entity::new("42"))));
/// ```
pub struct Flagger<T: Transport> {
    configuration_store: ConfigurationStore,
    batcher: IngestionBatcher<T>,
    default_entity: RwLock<Option<Entity>>,
    listeners: Mutex<Vec<(ListenerId, ConfigUpdateListener)>>,
    next_listener_id: AtomicU64,
    apply_server_batching: bool,
    /// Serializes configuration installs so that batching parameters always match the stored
    /// configuration.
    update_lock: Mutex<()>,
}

impl<T: Transport> Flagger<T> {
    /// Create a new `Flagger` using the specified configuration.
    ///
    /// Nothing is sent until [`Flagger::start`] is called.
    pub fn new(config: FlaggerConfig, transport: T) -> Self {
        Flagger {
            configuration_store: ConfigurationStore::new(),
            batcher: IngestionBatcher::new(config.batcher_config(), transport),
            default_entity: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            apply_server_batching: config.apply_server_batching,
            update_lock: Mutex::new(()),
        }
    }

    /// Start reporting: send the initial batch and start the flush timer. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.batcher.start()
    }

    /// Flush pending data and stop reporting. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.batcher.shutdown().await
    }

    /// Flush pending data now and wait for the send to complete.
    pub async fn flush(&self) {
        self.batcher.send_now().await
    }

    /// Install a new configuration. Returns `false` (and does nothing) if it is equal to the
    /// active one.
    ///
    /// On change, the batching parameters of the configuration are applied (unless disabled
    /// with [`FlaggerConfig::with_server_batching`]) and config update listeners are notified.
    pub fn set_config(&self, configuration: FlaggerConfiguration) -> bool {
        let configuration = {
            let _guard = lock(&self.update_lock);
            let Some(configuration) = self.configuration_store.update_configuration(configuration)
            else {
                log::debug!(target: "flagger", "received configuration is unchanged");
                return false;
            };
            if self.apply_server_batching {
                self.apply_batching(&configuration);
            }
            configuration
        };

        log::info!(target: "flagger",
                   flags = configuration.flags.len(),
                   max_calls = configuration.sdk_config.ingestion_max_calls,
                   interval_seconds = configuration.sdk_config.ingestion_interval_seconds;
                   "configuration updated");

        let listeners: Vec<ConfigUpdateListener> = lock(&self.listeners)
            .iter()
            .map(|(_id, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&configuration);
        }
        true
    }

    /// Parse `json` and install it as with [`Flagger::set_config`].
    pub fn set_config_json(&self, json: &str) -> Result<bool> {
        let configuration = FlaggerConfiguration::from_json(json).map_err(|err| {
            log::warn!(target: "flagger", "failed to parse configuration: {:?}", err);
            err
        })?;
        Ok(self.set_config(configuration))
    }

    /// Get the active configuration, if any.
    pub fn get_configuration(&self) -> Option<Arc<FlaggerConfiguration>> {
        self.configuration_store.get_configuration()
    }

    /// Whether a configuration has been installed.
    pub fn is_configured(&self) -> bool {
        self.configuration_store.get_configuration().is_some()
    }

    /// Register `listener` to be called after every configuration change.
    pub fn add_config_update_listener(
        &self,
        listener: impl Fn(&FlaggerConfiguration) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if no listener with this id is registered.
    pub fn remove_config_update_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let len = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != len
    }

    /// Set the entity used by calls that pass none. `None` clears it.
    ///
    /// An entity with an empty id is rejected and the previous default is kept.
    pub fn set_entity(&self, entity: Option<Entity>) {
        if entity.as_ref().is_some_and(|entity| entity.id.is_empty()) {
            log::warn!(target: "flagger", "entity id is empty, keeping previous default entity");
            return;
        }
        *self
            .default_entity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = entity;
    }

    /// Evaluate `codename` without reporting an exposure.
    pub fn evaluate(&self, codename: &str, entity: Option<&Entity>) -> EvaluationResult {
        let entity = self.resolve_entity(entity);
        let configuration = self.configuration_store.get_configuration();
        let result = evaluate(configuration.as_deref(), codename, entity.as_ref());

        log::trace!(target: "flagger",
                    codename,
                    entity:serde = entity,
                    variation:display = result.variation.codename,
                    reason:display = result.reason;
                    "evaluated a flag");
        result
    }

    pub fn is_enabled(&self, codename: &str, entity: Option<&Entity>) -> bool {
        self.evaluate_and_report("isEnabled", codename, entity)
            .is_enabled
    }

    pub fn is_sampled(&self, codename: &str, entity: Option<&Entity>) -> bool {
        self.evaluate_and_report("isSampled", codename, entity)
            .is_sampled
    }

    /// Codename of the variation served to the entity.
    pub fn get_variation(&self, codename: &str, entity: Option<&Entity>) -> String {
        self.evaluate_and_report("getVariation", codename, entity)
            .variation
            .codename
    }

    pub fn get_payload(&self, codename: &str, entity: Option<&Entity>) -> Payload {
        self.evaluate_and_report("getPayload", codename, entity)
            .payload
    }

    /// Report an entity and its attributes.
    pub fn publish(&self, entity: &Entity) {
        if entity.id.is_empty() {
            log::warn!(target: "flagger", "entity id is empty, not publishing");
            return;
        }
        self.batcher.ingest(IngestionData::entity(entity.normalized()));
    }

    /// Report a custom event for `entity`, or for the default entity.
    pub fn track(&self, name: &str, properties: Attributes, entity: Option<&Entity>) {
        let Some(entity) = self.resolve_entity(entity) else {
            log::warn!(target: "flagger", event = name; "no entity to track the event for");
            return;
        };
        if entity.id.is_empty() {
            log::warn!(target: "flagger", event = name; "entity id is empty, not tracking");
            return;
        }
        self.batcher
            .ingest(IngestionData::event(Event::new(name, properties, Some(entity))));
    }

    fn apply_batching(&self, configuration: &FlaggerConfiguration) {
        let sdk_config = &configuration.sdk_config;
        self.batcher.set_max_calls(sdk_config.ingestion_max_calls);
        if sdk_config.ingestion_interval_seconds > 0 {
            self.batcher
                .set_interval(Duration::from_secs(sdk_config.ingestion_interval_seconds));
        } else {
            log::warn!(target: "flagger", "ignoring zero ingestion interval");
        }
    }

    fn evaluate_and_report(
        &self,
        method_called: &str,
        codename: &str,
        entity: Option<&Entity>,
    ) -> EvaluationResult {
        let result = self.evaluate(codename, entity);
        if let Some(data) = IngestionData::exposure(method_called, &result) {
            self.batcher.ingest(data);
        }
        result
    }

    /// The given entity, or the default one, in normalized form.
    fn resolve_entity(&self, entity: Option<&Entity>) -> Option<Entity> {
        match entity {
            Some(entity) => Some(entity.normalized()),
            None => self
                .default_entity
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(Entity::normalized),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
