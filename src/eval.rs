//! Flag evaluation: the targeting and sampling decision engine.
//!
//! Evaluation is a pure function of a configuration snapshot, a codename and an entity. It never
//! fails and never touches the entity it is given; every outcome, including invalid input, is
//! described by the [`Reason`] on the returned [`EvaluationResult`].
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    configuration::{FlagConfig, FlaggerConfiguration, Payload, Variation},
    entity::Entity,
    filter::filters_match,
    sharder::{Hasher, Md5Hasher},
};

/// Why an evaluation produced its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    NoEntityProvided,
    IdIsEmpty,
    CodenameIsEmpty,
    FlagConfigIsEmpty,
    FlagNotInConfig,
    KillSwitchEngaged,
    IndividualBlacklist,
    IndividualWhitelist,
    GroupBlacklist,
    GroupWhitelist,
    FlagIsSampled,
    Default,
}

impl Reason {
    /// Human-readable description of the reason.
    pub fn description(&self) -> &'static str {
        match self {
            Reason::NoEntityProvided => "No entity provided to Flagger",
            Reason::IdIsEmpty => "Id is empty",
            Reason::CodenameIsEmpty => "Flag codename is empty",
            Reason::FlagConfigIsEmpty => "No flags in the current config",
            Reason::FlagNotInConfig => "Flag is not in the current config",
            Reason::KillSwitchEngaged => "Kill switch engaged",
            Reason::IndividualBlacklist => "Entity is individually blacklisted",
            Reason::IndividualWhitelist => "Entity is individually whitelisted",
            Reason::GroupBlacklist => "Entity's group is blacklisted",
            Reason::GroupWhitelist => "Entity's group is whitelisted",
            Reason::FlagIsSampled => "Entity selected via sampling from a subpopulation",
            Reason::Default => "Default (off) treatment reached",
        }
    }

    /// Results with these reasons carry no targeting signal and are never ingested.
    pub fn skips_ingestion(&self) -> bool {
        matches!(
            self,
            Reason::CodenameIsEmpty | Reason::NoEntityProvided | Reason::IdIsEmpty
        )
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Outcome of evaluating one flag for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub codename: String,
    pub is_enabled: bool,
    pub is_sampled: bool,
    pub variation: Variation,
    pub payload: Payload,
    pub entity: Option<Entity>,
    /// Flag salt, present once the flag was found in the configuration.
    pub hashkey: Option<String>,
    pub reason: Reason,
    /// `true` when the codename is unknown to the configuration.
    pub new_flag: bool,
}

impl EvaluationResult {
    fn off(
        codename: &str,
        reason: Reason,
        new_flag: bool,
        entity: Option<&Entity>,
        hashkey: Option<&str>,
    ) -> EvaluationResult {
        let variation = Variation::off();
        EvaluationResult {
            codename: codename.to_owned(),
            is_enabled: false,
            is_sampled: false,
            payload: variation.payload.clone(),
            variation,
            entity: entity.cloned(),
            hashkey: hashkey.map(str::to_owned),
            reason,
            new_flag,
        }
    }

    fn enabled(
        flag: &FlagConfig,
        variation: Variation,
        is_sampled: bool,
        entity: &Entity,
        reason: Reason,
    ) -> EvaluationResult {
        EvaluationResult {
            codename: flag.codename.clone(),
            is_enabled: !flag.kill_switch_engaged,
            is_sampled,
            payload: variation.payload.clone(),
            variation,
            entity: Some(entity.clone()),
            hashkey: Some(flag.hashkey.clone()),
            reason,
            new_flag: false,
        }
    }
}

/// Evaluate `codename` for `entity` using the default [`Md5Hasher`].
///
/// `configuration` is `None` while no configuration has been received yet, which evaluates the
/// same as a configuration without flags.
pub fn evaluate(
    configuration: Option<&FlaggerConfiguration>,
    codename: &str,
    entity: Option<&Entity>,
) -> EvaluationResult {
    evaluate_with_hasher(configuration, codename, entity, &Md5Hasher)
}

/// Evaluate `codename` for `entity`. The first matching rule wins:
///
/// 1. missing entity, empty id, empty codename;
/// 2. empty configuration, unknown flag (both report `new_flag`);
/// 3. kill switch;
/// 4. individual blacklist, individual whitelist;
/// 5. group blacklist, group whitelist;
/// 6. subpopulation sampling;
/// 7. default (off).
pub fn evaluate_with_hasher(
    configuration: Option<&FlaggerConfiguration>,
    codename: &str,
    entity: Option<&Entity>,
    hasher: &impl Hasher,
) -> EvaluationResult {
    let Some(entity) = entity else {
        return EvaluationResult::off(codename, Reason::NoEntityProvided, false, None, None);
    };

    if entity.id.is_empty() {
        log::warn!(target: "flagger", codename; "id is empty, returning \"off\" variation");
        return EvaluationResult::off(codename, Reason::IdIsEmpty, false, Some(entity), None);
    }

    if codename.is_empty() {
        log::warn!(target: "flagger", entity_id:display = entity.id; "codename is empty, returning \"off\" variation");
        return EvaluationResult::off(codename, Reason::CodenameIsEmpty, false, Some(entity), None);
    }

    let Some(configuration) = configuration.filter(|c| !c.flags.is_empty()) else {
        return EvaluationResult::off(codename, Reason::FlagConfigIsEmpty, true, Some(entity), None);
    };

    let Some(flag) = configuration.flag(codename) else {
        return EvaluationResult::off(codename, Reason::FlagNotInConfig, true, Some(entity), None);
    };

    flag.eval(&configuration.hash_key, entity, hasher)
}

impl FlaggerConfiguration {
    /// Evaluate `codename` against this configuration. See [`evaluate_with_hasher`].
    pub fn evaluate(
        &self,
        codename: &str,
        entity: Option<&Entity>,
        hasher: &impl Hasher,
    ) -> EvaluationResult {
        evaluate_with_hasher(Some(self), codename, entity, hasher)
    }
}

impl FlagConfig {
    /// Evaluate the flag rules for an entity that passed input validation.
    fn eval(&self, env_hash_key: &str, entity: &Entity, hasher: &impl Hasher) -> EvaluationResult {
        let off = |reason| {
            EvaluationResult::off(&self.codename, reason, false, Some(entity), Some(&self.hashkey))
        };

        if self.kill_switch_engaged {
            return off(Reason::KillSwitchEngaged);
        }

        let entity_type = Some(entity.kind());

        if self
            .blacklist
            .iter()
            .any(|listed| listed.entity_type.as_deref() == entity_type && listed.id == entity.id)
        {
            return off(Reason::IndividualBlacklist);
        }

        if let Some(listed) = self
            .whitelist
            .iter()
            .find(|listed| listed.entity_type.as_deref() == entity_type && listed.id == entity.id)
        {
            let variation = self.variation(&listed.variation);
            return EvaluationResult::enabled(self, variation, false, entity, Reason::IndividualWhitelist);
        }

        if let Some(group) = &entity.group {
            if self
                .blacklist
                .iter()
                .any(|listed| listed.id == group.id && listed.entity_type == group.group_type)
            {
                return off(Reason::GroupBlacklist);
            }

            if let Some(listed) = self
                .whitelist
                .iter()
                .find(|listed| listed.id == group.id && listed.entity_type == group.group_type)
            {
                let variation = self.variation(&listed.variation);
                return EvaluationResult::enabled(self, variation, false, entity, Reason::GroupWhitelist);
            }
        }

        let sampling_key = format!(
            "{}{}{}{}",
            env_hash_key,
            self.hashkey,
            entity.id,
            entity.kind()
        );
        let hashed_id = hasher.hash(&sampling_key);
        log::debug!(target: "flagger",
                    codename:display = self.codename,
                    entity_id:display = entity.id;
                    "hash value is {}", hashed_id);

        for subpopulation in &self.subpopulations {
            // The group type takes precedence when both the entity and its group match.
            let group_type = entity
                .group
                .as_ref()
                .and_then(|group| group.group_type.as_deref());
            let matched_type = if group_type == Some(subpopulation.entity_type.as_str()) {
                group_type
            } else if entity.kind() == subpopulation.entity_type {
                Some(entity.kind())
            } else {
                None
            };
            let Some(matched_type) = matched_type else {
                continue;
            };

            if filters_match(&subpopulation.filters, entity.attributes.as_ref())
                && hashed_id < subpopulation.sampling_percentage
            {
                let allocation_key = format!("{}{}{}", self.codename, entity.id, matched_type);
                let variation = choose_variation(&self.variations, &allocation_key, hasher);
                return EvaluationResult::enabled(self, variation, true, entity, Reason::FlagIsSampled);
            }
        }

        off(Reason::Default)
    }
}

/// Pick a variation by walking `variations` in order and accumulating their probabilities; the
/// first variation whose cumulative probability exceeds `hash(allocation_key)` wins. Falls back
/// to [`Variation::off`] when the weights never exceed the hash.
pub fn choose_variation(
    variations: &[Variation],
    allocation_key: &str,
    hasher: &impl Hasher,
) -> Variation {
    let hashed = hasher.hash(allocation_key);
    let mut cumulative = 0.0;
    for variation in variations {
        cumulative += variation.probability;
        if cumulative > hashed {
            return variation.clone();
        }
    }
    Variation::off()
}
