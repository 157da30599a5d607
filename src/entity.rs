//! Entities (the subjects flags are evaluated for) and their canonical form.
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Entity type assumed when the caller does not provide one.
pub const DEFAULT_ENTITY_TYPE: &str = "User";

/// Attribute bag attached to entities and groups.
pub type Attributes = HashMap<String, AttributeValue>;

/// Value of a single attribute.
///
/// Only strings, numbers and booleans are meaningful to targeting. Anything else that arrives
/// over the wire (objects, arrays, `null`) is preserved in [`AttributeValue::Other`] so that it
/// can be reported back, but it makes every filter evaluated against the bag fail.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Boolean(bool),
    #[from(ignore)]
    Other(serde_json::Value),
}

impl AttributeValue {
    /// Returns `true` for strings, numbers and booleans.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, AttributeValue::Other(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

/// The subject a flag is evaluated for, typically a user.
///
/// Entities are plain values: evaluation works on a [normalized](Entity::normalized) copy and
/// never modifies the caller's instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
}

/// A group an entity belongs to (e.g. a company).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub group_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
}

impl Entity {
    /// Create an entity with the given id and no type, name, group or attributes.
    ///
    /// ```
    /// # use flagger::Entity;
    /// let entity = Entity::new("42").with_type("User").with_attribute("country", "Japan");
    /// assert_eq!(entity.id, "42");
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        Entity {
            id: id.into(),
            entity_type: None,
            name: None,
            group: None,
            attributes: None,
        }
    }

    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_group(mut self, group: Group) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes
            .get_or_insert_with(Attributes::new)
            .insert(key.into(), value.into());
        self
    }

    /// Entity type, falling back to [`DEFAULT_ENTITY_TYPE`].
    pub fn kind(&self) -> &str {
        self.entity_type.as_deref().unwrap_or(DEFAULT_ENTITY_TYPE)
    }

    /// Return the canonical form of this entity:
    ///
    /// - `type` defaults to `"User"`;
    /// - `attributes` is always present and its keys are lower-cased;
    /// - `id` and `name` are copied into `attributes` unless already set there;
    /// - the group, if any, gets the same attribute treatment.
    ///
    /// `self` is left untouched.
    pub fn normalized(&self) -> Entity {
        let mut attributes = lowercase_keys(self.attributes.as_ref());
        if let Some(name) = &self.name {
            attributes
                .entry("name".to_owned())
                .or_insert_with(|| name.as_str().into());
        }
        attributes
            .entry("id".to_owned())
            .or_insert_with(|| self.id.as_str().into());

        Entity {
            id: self.id.clone(),
            entity_type: Some(self.kind().to_owned()),
            name: self.name.clone(),
            group: self.group.as_ref().map(Group::normalized),
            attributes: Some(attributes),
        }
    }
}

impl Group {
    pub fn new(id: impl Into<String>) -> Self {
        Group {
            id: id.into(),
            group_type: None,
            attributes: None,
        }
    }

    pub fn with_type(mut self, group_type: impl Into<String>) -> Self {
        self.group_type = Some(group_type.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes
            .get_or_insert_with(Attributes::new)
            .insert(key.into(), value.into());
        self
    }

    /// Same attribute treatment as [`Entity::normalized`]. The group type is not defaulted.
    pub fn normalized(&self) -> Group {
        let mut attributes = lowercase_keys(self.attributes.as_ref());
        attributes
            .entry("id".to_owned())
            .or_insert_with(|| self.id.as_str().into());

        Group {
            id: self.id.clone(),
            group_type: self.group_type.clone(),
            attributes: Some(attributes),
        }
    }
}

/// Copy `attributes` with lower-cased keys. When two keys collide, the one that was already
/// lower-case wins.
pub(crate) fn lowercase_keys(attributes: Option<&Attributes>) -> Attributes {
    let Some(attributes) = attributes else {
        return Attributes::new();
    };

    let mut result = Attributes::with_capacity(attributes.len());
    for (key, value) in attributes {
        let lower = key.to_lowercase();
        if lower == *key || !result.contains_key(&lower) {
            result.insert(lower, value.clone());
        }
    }
    result
}
