//! Type-scoped queries over state-view entities.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReaderError;
use crate::revision::StateViewEntity;

/// Sort direction for [`QueryOptions::order_by`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Equality filter on an entity field.
///
/// `id` and `owner_id` match entity columns; any other name matches a
/// top-level key of the entity data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub value: Value,
}

/// Query parameters for [`EntityRepository::fetch`](crate::revision::EntityRepository::fetch).
///
/// `start_at` is 1-based and inclusive; `start_after` skips that many
/// entries. The two are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default, rename = "where")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub order_by: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
    pub start_at: Option<usize>,
    pub start_after: Option<usize>,
    /// Include entities marked deleted.
    #[serde(default)]
    pub include_deleted: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_at(mut self, start_at: usize) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn start_after(mut self, start_after: usize) -> Self {
        self.start_after = Some(start_after);
        self
    }

    pub fn validate(&self) -> Result<(), ReaderError> {
        if self.start_at.is_some() && self.start_after.is_some() {
            return Err(ReaderError::InvalidQuery(
                "start_at and start_after are mutually exclusive".into(),
            ));
        }
        if self.start_at == Some(0) {
            return Err(ReaderError::InvalidQuery("start_at is 1-based".into()));
        }
        Ok(())
    }

    /// Filter, sort and page `entities`.
    pub fn apply(&self, entities: Vec<StateViewEntity>) -> Result<Vec<StateViewEntity>, ReaderError> {
        self.validate()?;

        let mut matched: Vec<StateViewEntity> = entities
            .into_iter()
            .filter(|e| self.include_deleted || !e.is_deleted)
            .filter(|e| {
                self.conditions
                    .iter()
                    .all(|c| field(e, &c.field).as_ref() == Some(&c.value))
            })
            .collect();

        if self.order_by.is_empty() {
            matched.sort_by(|a, b| a.id.cmp(&b.id));
        } else {
            matched.sort_by(|a, b| {
                self.order_by
                    .iter()
                    .map(|(name, order)| {
                        let ord = compare_values(field(a, name).as_ref(), field(b, name).as_ref());
                        match order {
                            SortOrder::Asc => ord,
                            SortOrder::Desc => ord.reverse(),
                        }
                    })
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        let skip = match (self.start_at, self.start_after) {
            (Some(at), _) => at.saturating_sub(1),
            (_, Some(after)) => after,
            _ => 0,
        };
        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(skip).take(limit).collect())
    }
}

fn field(entity: &StateViewEntity, name: &str) -> Option<Value> {
    match name {
        "id" => Some(Value::String(entity.id.clone())),
        "owner_id" => Some(Value::String(entity.owner_id.clone())),
        _ => entity.data.get(name).cloned(),
    }
}

/// Total order over JSON values: null < bool < number < string < other.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
