//! Usage ingestion: batching exposures, events and entities into periodically flushed payloads.
//!
//! [`IngestionBatcher`] accumulates [`IngestionData`] and hands batches to a [`Transport`]
//! through a [`RetryQueue`]. The batcher is a small state machine:
//!
//! - `NotStarted`: up to `max_calls` calls accumulate, nothing is sent. Beyond that only detected
//!   flags are kept. [`IngestionBatcher::start`] captures the async runtime, sends the initial
//!   batch (empty, to register SDK presence) and starts the flush timer.
//! - `Accumulating`: after every [`ingest`](IngestionBatcher::ingest), [`FlushPolicy`] decides
//!   whether to flush. A flush snapshots the accumulator into an [`IngestionPayload`], resets the
//!   accumulator and the timer, and sends the payload in the background.
//! - `ShutDown`: the timer is cancelled and pending data has been flushed one last time. Further
//!   data is dropped.
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    runtime::Handle,
    sync::{watch, Notify, OnceCell},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    entity::{Attributes, Entity},
    eval::EvaluationResult,
    retry_queue::RetryQueue,
    transport::Transport,
    Error, Result,
};

/// Identifies the SDK sending the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkInfo {
    pub name: String,
    pub version: String,
}

impl Default for SdkInfo {
    fn default() -> Self {
        SdkInfo {
            name: "rust".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// A record of one evaluation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exposure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashkey: Option<String>,
    pub codename: String,
    pub variation: String,
    pub entity: Entity,
    pub method_called: String,
    /// ISO-8601 timestamp.
    pub timestamp: String,
}

/// A custom event reported by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub name: String,
    pub properties: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Entity>,
    /// ISO-8601 timestamp.
    pub timestamp: String,
}

impl Event {
    pub fn new(name: impl Into<String>, properties: Attributes, entity: Option<Entity>) -> Event {
        Event {
            name: name.into(),
            properties,
            entity,
            timestamp: now(),
        }
    }
}

/// Data handed to the batcher by a single call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestionData {
    pub entities: Vec<Entity>,
    pub exposures: Vec<Exposure>,
    pub events: Vec<Event>,
    /// Codename of a flag missing from the configuration.
    pub detected_flag: Option<String>,
}

impl IngestionData {
    /// Build the exposure for an evaluation reported by `method_called`.
    ///
    /// Returns `None` for results that carry no targeting signal (empty codename, empty id, no
    /// entity).
    pub fn exposure(method_called: &str, result: &EvaluationResult) -> Option<IngestionData> {
        if result.reason.skips_ingestion() {
            log::warn!(target: "flagger", reason:display = result.reason; "ingestion skipped");
            return None;
        }
        let Some(entity) = result.entity.clone() else {
            log::warn!(target: "flagger", codename:display = result.codename; "ingestion skipped, no entity");
            return None;
        };

        Some(IngestionData {
            entities: vec![entity.clone()],
            exposures: vec![Exposure {
                hashkey: result.hashkey.clone(),
                codename: result.codename.clone(),
                variation: result.variation.codename.clone(),
                entity,
                method_called: method_called.to_owned(),
                timestamp: now(),
            }],
            events: vec![],
            detected_flag: result.new_flag.then(|| result.codename.clone()),
        })
    }

    /// Report an entity on its own.
    pub fn entity(entity: Entity) -> IngestionData {
        IngestionData {
            entities: vec![entity],
            ..IngestionData::default()
        }
    }

    /// Report a custom event, along with its entity.
    pub fn event(event: Event) -> IngestionData {
        IngestionData {
            entities: event.entity.iter().cloned().collect(),
            events: vec![event],
            ..IngestionData::default()
        }
    }
}

/// Wire form of a flushed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionPayload {
    pub id: Uuid,
    pub entities: Vec<Entity>,
    pub exposures: Vec<Exposure>,
    pub events: Vec<Event>,
    pub sdk_info: SdkInfo,
    pub detected_flags: Vec<String>,
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    MaxCalls,
    DetectedFlag,
    FirstExposures,
    Timer,
    EmptyIngestion,
    Shutdown,
    Manual,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlushTrigger::MaxCalls => "maximum calls have been reached",
            FlushTrigger::DetectedFlag => "new flag has been detected",
            FlushTrigger::FirstExposures => "first exposures are always ingested",
            FlushTrigger::Timer => "ingestion interval has run out",
            FlushTrigger::EmptyIngestion => "empty ingestion on start",
            FlushTrigger::Shutdown => "shutdown is called",
            FlushTrigger::Manual => "flush requested",
        })
    }
}

/// Decides whether an `ingest` call flushes immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub max_calls: usize,
    pub first_exposures_threshold: usize,
}

impl FlushPolicy {
    /// Guards are checked in priority order; the first one that holds wins:
    ///
    /// 1. `calls >= max_calls` → [`FlushTrigger::MaxCalls`];
    /// 2. the call reported an unknown flag → [`FlushTrigger::DetectedFlag`];
    /// 3. the call carried exposures and no more than `first_exposures_threshold` exposures have
    ///    been counted so far → [`FlushTrigger::FirstExposures`].
    pub fn trigger(
        &self,
        calls: usize,
        exposures_seen: usize,
        detected_flag: bool,
        has_exposures: bool,
    ) -> Option<FlushTrigger> {
        if calls >= self.max_calls {
            Some(FlushTrigger::MaxCalls)
        } else if detected_flag {
            Some(FlushTrigger::DetectedFlag)
        } else if has_exposures && exposures_seen <= self.first_exposures_threshold {
            Some(FlushTrigger::FirstExposures)
        } else {
            None
        }
    }
}

/// Configuration for [`IngestionBatcher`].
#[derive(Debug, Clone)]
pub struct IngestionBatcherConfig {
    /// Where payloads are sent.
    pub url: String,
    pub sdk_info: SdkInfo,
    /// Number of `ingest` calls after which the batch is flushed.
    ///
    /// Defaults to [`IngestionBatcherConfig::DEFAULT_MAX_CALLS`].
    pub max_calls: usize,
    /// Time between timer-driven flushes.
    ///
    /// Defaults to [`IngestionBatcherConfig::DEFAULT_INTERVAL`].
    pub interval: Duration,
    /// Number of first exposures that are flushed immediately. `0` disables early flushes.
    ///
    /// Defaults to [`IngestionBatcherConfig::DEFAULT_FIRST_EXPOSURES_THRESHOLD`].
    pub first_exposures_threshold: usize,
    /// Memory budget for payloads waiting to be retried.
    ///
    /// Defaults to [`RetryQueue::DEFAULT_MAX_MEMORY_SIZE`].
    pub max_retry_memory: usize,
}

impl IngestionBatcherConfig {
    /// Default value for [`IngestionBatcherConfig::max_calls`].
    pub const DEFAULT_MAX_CALLS: usize = 500;
    /// Default value for [`IngestionBatcherConfig::interval`].
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`IngestionBatcherConfig::first_exposures_threshold`].
    pub const DEFAULT_FIRST_EXPOSURES_THRESHOLD: usize = 10;

    pub fn new(url: impl Into<String>) -> IngestionBatcherConfig {
        IngestionBatcherConfig {
            url: url.into(),
            sdk_info: SdkInfo::default(),
            max_calls: IngestionBatcherConfig::DEFAULT_MAX_CALLS,
            interval: IngestionBatcherConfig::DEFAULT_INTERVAL,
            first_exposures_threshold: IngestionBatcherConfig::DEFAULT_FIRST_EXPOSURES_THRESHOLD,
            max_retry_memory: RetryQueue::DEFAULT_MAX_MEMORY_SIZE,
        }
    }

    pub fn with_sdk_info(mut self, sdk_info: SdkInfo) -> IngestionBatcherConfig {
        self.sdk_info = sdk_info;
        self
    }

    pub fn with_max_calls(mut self, max_calls: usize) -> IngestionBatcherConfig {
        self.max_calls = max_calls;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> IngestionBatcherConfig {
        self.interval = interval;
        self
    }

    pub fn with_first_exposures_threshold(mut self, threshold: usize) -> IngestionBatcherConfig {
        self.first_exposures_threshold = threshold;
        self
    }

    pub fn with_max_retry_memory(mut self, bytes: usize) -> IngestionBatcherConfig {
        self.max_retry_memory = bytes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Accumulating,
    ShutDown,
}

/// Data gathered since the last flush.
#[derive(Debug, Default)]
struct Accumulator {
    /// Keyed by entity id and type; the latest report wins.
    entities: HashMap<(String, String), Entity>,
    exposures: Vec<Exposure>,
    events: Vec<Event>,
    detected_flags: BTreeSet<String>,
}

impl Accumulator {
    fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.exposures.is_empty()
            && self.events.is_empty()
            && self.detected_flags.is_empty()
    }
}

#[derive(Debug)]
struct State {
    phase: Phase,
    accumulator: Accumulator,
    policy: FlushPolicy,
    /// `ingest` calls since the last flush.
    calls: usize,
    /// Exposures ingested so far, capped just above the first-exposures threshold.
    exposures_seen: usize,
    /// Whether any batch (possibly empty) has been sent.
    announced: bool,
}

impl State {
    /// Add `data` to the accumulator and return the flush it calls for, if any.
    fn accumulate(&mut self, data: IngestionData) -> Option<FlushTrigger> {
        let detected_flag = data.detected_flag.is_some();
        let has_exposures = !data.exposures.is_empty();

        for entity in data.entities {
            let key = (entity.id.clone(), entity.kind().to_owned());
            self.accumulator.entities.insert(key, entity);
        }
        self.accumulator.events.extend(data.events);
        for exposure in data.exposures {
            self.accumulator.exposures.push(exposure);
            if self.exposures_seen <= self.policy.first_exposures_threshold {
                self.exposures_seen += 1;
            }
        }
        if let Some(codename) = data.detected_flag {
            self.accumulator.detected_flags.insert(codename);
        }
        self.calls += 1;

        self.policy
            .trigger(self.calls, self.exposures_seen, detected_flag, has_exposures)
    }

    /// Like [`State::accumulate`], but once `max_calls` calls are buffered only detected flags are
    /// kept.
    fn accumulate_before_start(&mut self, data: IngestionData) {
        if self.calls < self.policy.max_calls {
            self.accumulate(data);
            if self.calls == self.policy.max_calls {
                log::warn!(target: "flagger",
                           max_calls = self.policy.max_calls;
                           "ingestion batcher not started, dropping further data");
            }
        } else if let Some(codename) = data.detected_flag {
            self.accumulator.detected_flags.insert(codename);
        }
    }

    /// Snapshot and reset the accumulator. Returns `None` for an empty accumulator, except for
    /// the very first batch.
    fn take_payload(&mut self, sdk_info: &SdkInfo) -> Option<IngestionPayload> {
        if self.accumulator.is_empty() && self.announced {
            return None;
        }
        self.announced = true;
        self.calls = 0;

        let accumulator = std::mem::take(&mut self.accumulator);
        Some(IngestionPayload {
            id: Uuid::new_v4(),
            entities: accumulator.entities.into_values().collect(),
            exposures: accumulator.exposures,
            events: accumulator.events,
            sdk_info: sdk_info.clone(),
            detected_flags: accumulator.detected_flags.into_iter().collect(),
        })
    }
}

struct Inner<T> {
    url: String,
    sdk_info: SdkInfo,
    transport: T,
    state: Mutex<State>,
    retry_queue: tokio::sync::Mutex<RetryQueue>,
    runtime: OnceLock<Handle>,
    interval: watch::Sender<Duration>,
    /// Restarts the timer countdown.
    reset: Notify,
    /// Sends that have been spawned and may not have completed yet.
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

/// Accumulates ingestion data and flushes it in bounded batches.
///
/// Must be [started](IngestionBatcher::start) inside a tokio runtime before anything is sent.
pub struct IngestionBatcher<T: Transport> {
    inner: Arc<Inner<T>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    shutdown: OnceCell<()>,
}

impl<T: Transport> IngestionBatcher<T> {
    pub fn new(config: IngestionBatcherConfig, transport: T) -> IngestionBatcher<T> {
        let (interval, _) = watch::channel(config.interval);
        IngestionBatcher {
            inner: Arc::new(Inner {
                url: config.url,
                sdk_info: config.sdk_info,
                transport,
                state: Mutex::new(State {
                    phase: Phase::NotStarted,
                    accumulator: Accumulator::default(),
                    policy: FlushPolicy {
                        max_calls: config.max_calls,
                        first_exposures_threshold: config.first_exposures_threshold,
                    },
                    calls: 0,
                    exposures_seen: 0,
                    announced: false,
                }),
                retry_queue: tokio::sync::Mutex::new(RetryQueue::new(config.max_retry_memory)),
                runtime: OnceLock::new(),
                interval,
                reset: Notify::new(),
                in_flight: Mutex::new(Vec::new()),
            }),
            timer: Mutex::new(None),
            shutdown: OnceCell::new(),
        }
    }

    /// Capture the current tokio runtime, send the initial batch and start the flush timer.
    ///
    /// Calling `start` again is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::NotStarted`] if called outside of a tokio runtime.
    /// - [`Error::ShutDown`] if the batcher has been shut down.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| Error::NotStarted)?;
        {
            let mut state = self.inner.lock_state();
            match state.phase {
                Phase::ShutDown => return Err(Error::ShutDown),
                Phase::Accumulating => return Ok(()),
                Phase::NotStarted => {
                    let _ = self.inner.runtime.set(runtime.clone());
                    state.phase = Phase::Accumulating;
                }
            }
        }

        let timer = runtime.spawn(Inner::run_timer(Arc::clone(&self.inner)));
        *lock(&self.timer) = Some(timer);

        self.inner.flush(FlushTrigger::EmptyIngestion);
        Ok(())
    }

    /// Add `data` to the current batch and flush if [`FlushPolicy`] says so.
    pub fn ingest(&self, data: IngestionData) {
        let payload = {
            let mut state = self.inner.lock_state();
            match state.phase {
                Phase::ShutDown => {
                    log::warn!(target: "flagger", "ingestion batcher is shut down, dropping data");
                    return;
                }
                Phase::NotStarted => {
                    state.accumulate_before_start(data);
                    return;
                }
                Phase::Accumulating => {}
            }
            let Some(trigger) = state.accumulate(data) else {
                return;
            };
            state
                .take_payload(&self.inner.sdk_info)
                .map(|payload| (trigger, payload))
        };

        if let Some((trigger, payload)) = payload {
            self.inner.dispatch(trigger, payload);
        }
    }

    /// Change the number of calls that triggers a flush.
    pub fn set_max_calls(&self, max_calls: usize) {
        self.inner.lock_state().policy.max_calls = max_calls;
    }

    /// Change the number of first exposures that are flushed immediately.
    pub fn set_first_exposures_threshold(&self, threshold: usize) {
        self.inner.lock_state().policy.first_exposures_threshold = threshold;
    }

    /// Change the flush interval. The running countdown restarts with the new interval.
    pub fn set_interval(&self, interval: Duration) {
        self.inner.interval.send_replace(interval);
    }

    /// Change the retry queue memory budget.
    pub async fn set_max_retry_memory(&self, bytes: usize) {
        self.inner.retry_queue.lock().await.set_max_memory(bytes);
    }

    /// Flush whatever is pending and wait for all sends, including earlier ones, to complete.
    pub async fn send_now(&self) {
        self.inner.flush(FlushTrigger::Manual);
        self.inner.wait_in_flight().await;
    }

    /// Cancel the timer, flush pending data one last time and wait for the send to complete.
    ///
    /// Safe to call repeatedly and concurrently: every caller waits for the same final flush.
    pub async fn shutdown(&self) {
        self.shutdown
            .get_or_init(|| async {
                if let Some(timer) = lock(&self.timer).take() {
                    timer.abort();
                }
                {
                    let mut state = self.inner.lock_state();
                    state.phase = Phase::ShutDown;
                    if let Ok(runtime) = Handle::try_current() {
                        let _ = self.inner.runtime.set(runtime);
                    }
                }
                self.inner.flush(FlushTrigger::Shutdown);
                self.inner.wait_in_flight().await;
                log::debug!(target: "flagger", "ingestion batcher shut down");
            })
            .await;
    }

    #[cfg(test)]
    pub(crate) async fn settle(&self) {
        self.inner.wait_in_flight().await;
    }

    #[cfg(test)]
    pub(crate) fn max_calls(&self) -> usize {
        self.inner.lock_state().policy.max_calls
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> (usize, usize, usize) {
        let state = self.inner.lock_state();
        (
            state.accumulator.exposures.len(),
            state.accumulator.entities.len(),
            state.accumulator.detected_flags.len(),
        )
    }

    #[cfg(test)]
    pub(crate) async fn retry_queue_len(&self) -> usize {
        self.inner.retry_queue.lock().await.len()
    }
}

impl<T: Transport> Drop for IngestionBatcher<T> {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

impl<T: Transport> Inner<T> {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Flush the accumulator regardless of the policy.
    fn flush(self: &Arc<Self>, trigger: FlushTrigger) {
        if self.runtime.get().is_none() {
            log::debug!(target: "flagger", trigger:display; "batcher not started, keeping data");
            return;
        }
        let payload = self.lock_state().take_payload(&self.sdk_info);
        if let Some(payload) = payload {
            self.dispatch(trigger, payload);
        }
    }

    /// Serialize `payload` and send it in the background.
    fn dispatch(self: &Arc<Self>, trigger: FlushTrigger, payload: IngestionPayload) {
        let Some(runtime) = self.runtime.get() else {
            return;
        };
        log::debug!(target: "flagger",
                    trigger:display,
                    batch_id:display = payload.id,
                    exposures = payload.exposures.len(),
                    events = payload.events.len(),
                    entities = payload.entities.len();
                    "{trigger} triggers ingestion request");

        if trigger != FlushTrigger::Timer {
            self.reset.notify_one();
        }

        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(err) => {
                log::warn!(target: "flagger", batch_id:display = payload.id; "{}", Error::Serialization(Arc::new(err)));
                return;
            }
        };

        let inner = Arc::clone(self);
        let handle = runtime.spawn(async move {
            let mut retry_queue = inner.retry_queue.lock().await;
            if let Err(err) = retry_queue.send(&inner.url, body, &inner.transport).await {
                log::debug!(target: "flagger", queued = retry_queue.len(); "ingestion request failed: {}", err);
            }
        });

        let mut in_flight = lock(&self.in_flight);
        in_flight.retain(|handle| !handle.is_finished());
        in_flight.push(handle);
    }

    async fn wait_in_flight(&self) {
        let handles = std::mem::take(&mut *lock(&self.in_flight));
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_timer(inner: Arc<Self>) {
        let mut interval = inner.interval.subscribe();
        loop {
            let period = *interval.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    inner.flush(FlushTrigger::Timer);
                }
                _ = inner.reset.notified() => {}
                changed = interval.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        Event, FlushPolicy, FlushTrigger, IngestionBatcher, IngestionBatcherConfig, IngestionData,
    };
    use crate::{
        configuration::{FlagConfig, FlaggerConfiguration, SdkConfig},
        entity::{Attributes, Entity},
        eval::{evaluate, Reason},
        transport::MockTransport,
    };

    fn batcher(config: IngestionBatcherConfig) -> (IngestionBatcher<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        (IngestionBatcher::new(config, transport.clone()), transport)
    }

    fn config() -> IngestionBatcherConfig {
        IngestionBatcherConfig::new("https://ingestion.test/").with_first_exposures_threshold(0)
    }

    fn event(name: &str, entity: &str) -> IngestionData {
        IngestionData::event(Event::new(name, Attributes::new(), Some(Entity::new(entity))))
    }

    fn exposure(codename: &str, entity: &str) -> IngestionData {
        let configuration = FlaggerConfiguration {
            hash_key: "env".to_owned(),
            flags: vec![FlagConfig {
                hashkey: "h".to_owned(),
                codename: "known".to_owned(),
                kill_switch_engaged: false,
                variations: vec![],
                subpopulations: vec![],
                blacklist: vec![],
                whitelist: vec![],
            }],
            sdk_config: SdkConfig::default(),
        };
        let result = evaluate(Some(&configuration), codename, Some(&Entity::new(entity).normalized()));
        IngestionData::exposure("isEnabled", &result).unwrap()
    }

    #[test]
    fn policy_priorities() {
        let policy = FlushPolicy {
            max_calls: 3,
            first_exposures_threshold: 10,
        };
        assert_eq!(policy.trigger(3, 1, true, true), Some(FlushTrigger::MaxCalls));
        assert_eq!(policy.trigger(1, 1, true, true), Some(FlushTrigger::DetectedFlag));
        assert_eq!(policy.trigger(1, 10, false, true), Some(FlushTrigger::FirstExposures));
        assert_eq!(policy.trigger(1, 11, false, true), None);
        assert_eq!(policy.trigger(1, 1, false, false), None);
    }

    #[test]
    fn skips_meaningless_exposures() {
        for (codename, entity, reason) in [
            ("", Some(Entity::new("1")), Reason::CodenameIsEmpty),
            ("flag", Some(Entity::new("")), Reason::IdIsEmpty),
            ("flag", None, Reason::NoEntityProvided),
        ] {
            let result = evaluate(None, codename, entity.as_ref());
            assert_eq!(result.reason, reason);
            assert!(IngestionData::exposure("isEnabled", &result).is_none());
        }
    }

    #[test]
    fn exposure_for_unknown_flag_reports_detected_flag() {
        let data = exposure("unknown", "1");
        assert_eq!(data.detected_flag.as_deref(), Some("unknown"));
        assert_eq!(data.entities.len(), 1);
        assert_eq!(data.exposures[0].variation, "off");
        assert_eq!(data.exposures[0].method_called, "isEnabled");

        let data = exposure("known", "1");
        assert_eq!(data.detected_flag, None);
        assert_eq!(data.exposures[0].hashkey.as_deref(), Some("h"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_sends_empty_batch_once() {
        let (batcher, transport) = batcher(config());
        batcher.start().unwrap();
        batcher.settle().await;

        let payloads = transport.sent_payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["entities"], serde_json::json!([]));
        assert_eq!(payloads[0]["sdkInfo"]["name"], "rust");
        assert_eq!(transport.sent_urls(), vec!["https://ingestion.test/"]);

        // empty timer flushes are suppressed
        tokio::time::sleep(Duration::from_secs(60 * 3 + 1)).await;
        batcher.settle().await;
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_after_max_calls() {
        let (batcher, transport) = batcher(config().with_max_calls(5));
        batcher.start().unwrap();

        for i in 0..4 {
            batcher.ingest(event("click", &i.to_string()));
        }
        batcher.settle().await;
        assert_eq!(transport.sent_count(), 1);

        batcher.ingest(event("click", "4"));
        batcher.settle().await;
        let payloads = transport.sent_payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1]["events"].as_array().unwrap().len(), 5);
        assert_eq!(payloads[1]["entities"].as_array().unwrap().len(), 5);

        // counter was reset
        for i in 0..4 {
            batcher.ingest(event("click", &i.to_string()));
        }
        batcher.settle().await;
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_immediately_on_detected_flag() {
        let (batcher, transport) = batcher(config());
        batcher.start().unwrap();

        batcher.ingest(event("click", "1"));
        batcher.ingest(exposure("unknown", "2"));
        batcher.settle().await;

        let payloads = transport.sent_payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1]["detectedFlags"], serde_json::json!(["unknown"]));
        assert_eq!(payloads[1]["events"].as_array().unwrap().len(), 1);
        assert_eq!(payloads[1]["exposures"].as_array().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_first_exposures() {
        let (batcher, transport) = batcher(config().with_first_exposures_threshold(3));
        batcher.start().unwrap();

        for i in 0..5 {
            batcher.ingest(exposure("known", &i.to_string()));
        }
        batcher.settle().await;

        // hello + the first 3 exposures
        assert_eq!(transport.sent_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_pending_data() {
        let (batcher, transport) = batcher(config());
        batcher.start().unwrap();
        batcher.ingest(event("click", "1"));

        tokio::time::sleep(Duration::from_secs(59)).await;
        batcher.settle().await;
        assert_eq!(transport.sent_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        batcher.settle().await;
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_resets_timer() {
        let (batcher, transport) = batcher(config());
        batcher.start().unwrap();

        tokio::time::sleep(Duration::from_secs(50)).await;
        batcher.ingest(exposure("unknown", "1"));
        batcher.ingest(event("click", "1"));
        batcher.settle().await;
        assert_eq!(transport.sent_count(), 2);

        // the countdown restarted at t=50
        tokio::time::sleep(Duration::from_secs(20)).await;
        batcher.settle().await;
        assert_eq!(transport.sent_count(), 2);

        tokio::time::sleep(Duration::from_secs(41)).await;
        batcher.settle().await;
        assert_eq!(transport.sent_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn set_interval_reschedules_timer() {
        let (batcher, transport) = batcher(config());
        batcher.start().unwrap();
        batcher.ingest(event("click", "1"));

        batcher.set_interval(Duration::from_millis(250));
        tokio::time::sleep(Duration::from_millis(300)).await;
        batcher.settle().await;
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deduplicates_entities_by_id_and_type() {
        let (batcher, transport) = batcher(config());
        batcher.start().unwrap();

        batcher.ingest(IngestionData::entity(Entity::new("1").with_attribute("v", 1)));
        batcher.ingest(IngestionData::entity(Entity::new("1").with_attribute("v", 2)));
        batcher.ingest(IngestionData::entity(Entity::new("1").with_type("Company")));
        batcher.send_now().await;

        let payloads = transport.sent_payloads();
        let entities = payloads[1]["entities"].as_array().unwrap();
        assert_eq!(entities.len(), 2);
        let user = entities.iter().find(|e| e.get("type").is_none()).unwrap();
        assert_eq!(user["attributes"]["v"], 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_sent_before_start() {
        let (batcher, transport) = batcher(config());
        batcher.ingest(exposure("unknown", "1"));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.sent_count(), 0);

        batcher.start().unwrap();
        batcher.settle().await;
        let payloads = transport.sent_payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["detectedFlags"], serde_json::json!(["unknown"]));
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_before_start_is_bounded() {
        let (batcher, transport) = batcher(config().with_max_calls(5));

        for i in 0..1_000 {
            batcher.ingest(exposure("known", &i.to_string()));
        }
        batcher.ingest(exposure("unknown", "late"));
        assert_eq!(batcher.pending(), (5, 5, 1));

        batcher.start().unwrap();
        batcher.settle().await;

        let payloads = transport.sent_payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["exposures"].as_array().unwrap().len(), 5);
        assert_eq!(payloads[0]["detectedFlags"], serde_json::json!(["unknown"]));
        assert_eq!(batcher.pending(), (0, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_without_start_flushes_pending_data() {
        let (batcher, transport) = batcher(config());
        batcher.ingest(event("click", "1"));
        batcher.ingest(exposure("unknown", "1"));

        batcher.shutdown().await;

        let payloads = transport.sent_payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["events"][0]["name"], "click");
        assert_eq!(payloads[0]["detectedFlags"], serde_json::json!(["unknown"]));
        assert!(batcher.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_once() {
        let (batcher, transport) = batcher(config());
        batcher.start().unwrap();
        batcher.ingest(event("click", "1"));

        tokio::join!(batcher.shutdown(), batcher.shutdown());
        batcher.shutdown().await;

        let payloads = transport.sent_payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1]["events"][0]["name"], "click");

        batcher.ingest(exposure("unknown", "1"));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.sent_count(), 2);
        assert!(batcher.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batches_are_retried() {
        let (batcher, transport) = batcher(config());
        transport.set_failing(true);
        batcher.start().unwrap();
        batcher.ingest(exposure("unknown", "1"));
        batcher.settle().await;
        assert_eq!(batcher.retry_queue_len().await, 2);

        transport.set_failing(false);
        batcher.ingest(exposure("another", "1"));
        batcher.settle().await;
        assert_eq!(batcher.retry_queue_len().await, 0);
        assert_eq!(transport.sent_count(), 3);
    }

    #[test]
    fn start_requires_runtime() {
        let (batcher, _transport) = batcher(config());
        assert!(matches!(batcher.start(), Err(crate::Error::NotStarted)));
    }
}
