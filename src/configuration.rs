//! Server-provided flag configuration.
//!
//! A [`FlaggerConfiguration`] is immutable once received. Updates replace it completely (see
//! [`ConfigurationStore`](crate::configuration_store::ConfigurationStore)).
use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{entity::AttributeValue, filter::Filter, Error, Result};

/// Full configuration snapshot for one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggerConfiguration {
    /// Environment-wide salt mixed into every sampling hash.
    pub hash_key: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub flags: Vec<FlagConfig>,
    #[serde(default)]
    pub sdk_config: SdkConfig,
}

impl FlaggerConfiguration {
    /// Parse a configuration from its JSON wire form.
    pub fn from_json(json: &str) -> Result<FlaggerConfiguration> {
        serde_json::from_str(json).map_err(|err| Error::ConfigurationParse(Arc::new(err)))
    }

    /// Find a flag by codename. If several flags share a codename, the first one wins.
    pub fn flag(&self, codename: &str) -> Option<&FlagConfig> {
        self.flags.iter().find(|flag| flag.codename == codename)
    }

    /// Codenames of all flags in the configuration, in declared order.
    pub fn codenames(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().map(|flag| flag.codename.as_str())
    }
}

/// Batching parameters pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdkConfig {
    #[serde(
        rename = "SDK_INGESTION_INTERVAL",
        alias = "ingestionIntervalSeconds",
        default = "default_ingestion_interval"
    )]
    pub ingestion_interval_seconds: u64,
    #[serde(
        rename = "SDK_INGESTION_MAX_CALLS",
        alias = "ingestionMaxCalls",
        default = "default_ingestion_max_calls"
    )]
    pub ingestion_max_calls: usize,
}

fn default_ingestion_interval() -> u64 {
    60
}

fn default_ingestion_max_calls() -> usize {
    500
}

impl Default for SdkConfig {
    fn default() -> Self {
        SdkConfig {
            ingestion_interval_seconds: default_ingestion_interval(),
            ingestion_max_calls: default_ingestion_max_calls(),
        }
    }
}

/// Rule set of a single feature flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagConfig {
    /// Per-flag salt.
    pub hashkey: String,
    pub codename: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub kill_switch_engaged: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variations: Vec<Variation>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub subpopulations: Vec<Subpopulation>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub blacklist: Vec<ListedEntity>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub whitelist: Vec<WhitelistedEntity>,
}

impl FlagConfig {
    /// Find a variation by codename, falling back to [`Variation::off`].
    pub fn variation(&self, codename: &str) -> Variation {
        self.variations
            .iter()
            .find(|variation| variation.codename == codename)
            .cloned()
            .unwrap_or_else(Variation::off)
    }
}

/// Payload attached to a variation.
pub type Payload = HashMap<String, AttributeValue>;

/// One weighted treatment arm of a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub codename: String,
    pub probability: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: Payload,
}

impl Variation {
    /// Codename of the empty variation returned whenever a flag is off.
    pub const OFF: &'static str = "off";

    /// The empty/off variation: `{codename: "off", probability: 1.0, payload: {}}`.
    pub fn off() -> Variation {
        Variation {
            codename: Variation::OFF.to_owned(),
            probability: 1.0,
            payload: Payload::new(),
        }
    }
}

/// A filtered, percentage-sampled slice of entities of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subpopulation {
    pub entity_type: String,
    pub sampling_percentage: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub filters: Vec<TryParse<Filter>>,
}

/// Blacklist entry. Matches entities (or groups) by id and type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedEntity {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

/// Whitelist entry. Like [`ListedEntity`], plus the variation to serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistedEntity {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub variation: String,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}
impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}
impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}
impl From<Filter> for TryParse<Filter> {
    fn from(value: Filter) -> Self {
        TryParse::Parsed(value)
    }
}

/// Treat an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
