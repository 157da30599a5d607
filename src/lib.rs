//! Client-side feature flag evaluation with usage reporting.
//!
//! # Overview
//!
//! The crate revolves around a [`Flagger`] that evaluates feature flags for [`Entity`]s. An
//! entity has an id, an optional type (`"User"` by default), an optional [`Group`] and key-value
//! attributes. Evaluation is a pure function of the active [`FlaggerConfiguration`], the flag
//! codename and the entity, and results in an [`EvaluationResult`] describing whether the flag
//! is enabled, which variation (and payload) was served and the [`Reason`] for it.
//!
//! Every `is_enabled`/`is_sampled`/`get_variation`/`get_payload` call is reported as an
//! exposure. Exposures, custom events and entities are batched and handed to a [`Transport`]
//! that you provide; undeliverable batches are kept in a bounded [`RetryQueue`].
//!
//! # Error Handling
//!
//! Flag evaluation never fails: invalid input (no entity, empty id, unknown flag) evaluates to
//! the `"off"` variation with an explanatory [`Reason`]. Errors are represented by the [`Error`]
//! enum and only surface from configuration parsing and the ingestion lifecycle.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages,
//! under the `flagger` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into SDK operations.
//!
//! # Examples
//!
//! Examples can be found in the `demos` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod config;
mod configuration;
mod configuration_store;
mod entity;
mod error;
mod eval;
mod filter;
pub mod ingestion;
mod retry_queue;
mod sharder;
mod transport;

pub use client::{Flagger, ListenerId};
pub use config::FlaggerConfig;
pub use configuration::{
    FlagConfig, FlaggerConfiguration, ListedEntity, Payload, SdkConfig, Subpopulation, TryParse,
    Variation, WhitelistedEntity,
};
pub use configuration_store::ConfigurationStore;
pub use entity::{AttributeValue, Attributes, Entity, Group, DEFAULT_ENTITY_TYPE};
pub use error::{Error, Result};
pub use eval::{choose_variation, evaluate, evaluate_with_hasher, EvaluationResult, Reason};
pub use filter::{filters_match, Filter, FilterOperator, FilterType, FilterValue};
pub use retry_queue::RetryQueue;
pub use sharder::{Hasher, Md5Hasher};
pub use transport::Transport;
