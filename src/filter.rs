//! Attribute filters used by subpopulations to target entities.
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::{
    configuration::TryParse,
    entity::{lowercase_keys, AttributeValue, Attributes},
};

/// A single typed predicate over one entity attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub attribute_name: String,
    pub operator: FilterOperator,
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    pub value: FilterValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOperator {
    Is,
    IsNot,
    In,
    NotIn,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterType {
    String,
    Number,
    Boolean,
    /// ISO-8601 string or epoch milliseconds (as a number or a numeric string).
    Date,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Multiple(Vec<AttributeValue>),
    Single(AttributeValue),
}

impl<T: Into<AttributeValue>> From<T> for FilterValue {
    fn from(value: T) -> Self {
        Self::Single(value.into())
    }
}
impl<T: Into<AttributeValue>> From<Vec<T>> for FilterValue {
    fn from(value: Vec<T>) -> Self {
        Self::Multiple(value.into_iter().map(Into::into).collect())
    }
}

/// Returns `true` if `attributes` satisfy every filter.
///
/// An empty filter list always matches. Otherwise, the match fails if there are no attributes,
/// if any attribute is not a scalar, or if any filter could not be parsed. Attribute names are
/// compared case-insensitively.
pub fn filters_match(filters: &[TryParse<Filter>], attributes: Option<&Attributes>) -> bool {
    if filters.is_empty() {
        return true;
    }
    let Some(attributes) = attributes else {
        return false;
    };
    if !attributes.values().all(AttributeValue::is_scalar) {
        return false;
    }

    let attributes = lowercase_keys(Some(attributes));
    filters.iter().all(|filter| match filter {
        TryParse::Parsed(filter) => filter.matches(&attributes),
        TryParse::ParseFailed(value) => {
            log::debug!(target: "flagger", filter:serde = value; "skipping unparseable filter");
            false
        }
    })
}

impl Filter {
    /// Evaluate the filter against attributes whose keys are already lower-cased.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        let attribute = attributes.get(&self.attribute_name.to_lowercase());
        self.operator.eval(self.filter_type, attribute, &self.value)
    }
}

/// Attribute or filter value after type coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand<'a> {
    String(&'a str),
    Number(f64),
    Boolean(bool),
    /// Epoch milliseconds.
    Date(i64),
}

impl<'a> Operand<'a> {
    fn new(value: &'a AttributeValue, filter_type: FilterType) -> Option<Operand<'a>> {
        if filter_type == FilterType::Date {
            return parse_date(value).map(Operand::Date);
        }
        match value {
            AttributeValue::String(s) => Some(Operand::String(s)),
            AttributeValue::Number(n) => Some(Operand::Number(*n)),
            AttributeValue::Boolean(b) => Some(Operand::Boolean(*b)),
            AttributeValue::Other(_) => None,
        }
    }

    fn compare(&self, other: &Operand) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Operand::Number(a), Operand::Number(b)) => a.partial_cmp(b),
            (Operand::Date(a), Operand::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl FilterOperator {
    /// Applying `FilterOperator` to the values. Returns `false` if the operator cannot be applied
    /// or there's a misconfiguration.
    pub fn eval(
        &self,
        filter_type: FilterType,
        attribute: Option<&AttributeValue>,
        filter_value: &FilterValue,
    ) -> bool {
        self.try_eval(filter_type, attribute, filter_value)
            .unwrap_or(false)
    }

    /// Try applying `FilterOperator` to the values, returning `None` if the operator cannot be
    /// applied.
    fn try_eval(
        &self,
        filter_type: FilterType,
        attribute: Option<&AttributeValue>,
        filter_value: &FilterValue,
    ) -> Option<bool> {
        let Some(attribute) = attribute else {
            // Absence trivially satisfies "is not X" and "not in set".
            return match (self, filter_value) {
                (Self::IsNot, FilterValue::Single(_)) => Some(true),
                (Self::NotIn, FilterValue::Multiple(_)) => Some(true),
                _ => None,
            };
        };
        let attribute = Operand::new(attribute, filter_type)?;

        match self {
            Self::Is | Self::IsNot => {
                let value = match filter_value {
                    FilterValue::Single(v) => Operand::new(v, filter_type)?,
                    FilterValue::Multiple(_) => return None,
                };
                let is = attribute == value;
                Some(if *self == Self::Is { is } else { !is })
            }

            Self::In | Self::NotIn => {
                let values = match filter_value {
                    FilterValue::Multiple(v) => v,
                    FilterValue::Single(_) => return None,
                };
                let is_in = values
                    .iter()
                    .filter_map(|v| Operand::new(v, filter_type))
                    .any(|v| v == attribute);
                Some(if *self == Self::In { is_in } else { !is_in })
            }

            Self::Lt | Self::Lte | Self::Gt | Self::Gte => {
                let value = match filter_value {
                    FilterValue::Single(v) => Operand::new(v, filter_type)?,
                    FilterValue::Multiple(_) => return None,
                };
                let ordering = attribute.compare(&value)?;
                Some(match self {
                    Self::Lt => ordering.is_lt(),
                    Self::Lte => ordering.is_le(),
                    Self::Gt => ordering.is_gt(),
                    Self::Gte => ordering.is_ge(),
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }
        }
    }
}

/// Largest absolute epoch-millisecond value representable as a date (±100,000,000 days).
const MAX_EPOCH_MILLIS: f64 = 8.64e15;

/// Parse an attribute or filter value into epoch milliseconds.
fn parse_date(value: &AttributeValue) -> Option<i64> {
    match value {
        AttributeValue::String(s) => parse_date_str(s.trim()),
        AttributeValue::Number(n) => epoch_millis(*n),
        AttributeValue::Boolean(_) | AttributeValue::Other(_) => None,
    }
}

fn parse_date_str(s: &str) -> Option<i64> {
    if let Ok(date) = DateTime::parse_from_rfc3339(s) {
        return Some(date.timestamp_millis());
    }
    if let Ok(date) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(date.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
    }
    s.parse::<f64>().ok().and_then(epoch_millis)
}

fn epoch_millis(n: f64) -> Option<i64> {
    (n.is_finite() && n.abs() <= MAX_EPOCH_MILLIS).then(|| n.trunc() as i64)
}
