//! Remote durable store boundary.
//!
//! The tracking service and the reconciler only ever talk to a collection
//! service through [`RemoteStore`]: five verbs over JSON rows, with
//! equality/inequality/date-range filters and descending ordering.
//! [`HostedStore`] is a `Database`-backed implementation used by
//! `fitlog serve` and by tests.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    WorkoutCompletions,
    MealCompletions,
    UserProfiles,
}

impl Collection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkoutCompletions => "workout_completions",
            Self::MealCompletions => "meal_completions",
            Self::UserProfiles => "user_profiles",
        }
    }

    /// Columns forming the backend's uniqueness constraint.
    #[must_use]
    pub fn conflict_keys(self) -> &'static [&'static str] {
        match self {
            Self::WorkoutCompletions => &["user_id", "workout_date", "workout_day_name"],
            Self::MealCompletions => &["user_id", "meal_date", "meal_type"],
            Self::UserProfiles => &["user_id"],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "workout_completions" => Ok(Self::WorkoutCompletions),
            "meal_completions" => Ok(Self::MealCompletions),
            "user_profiles" => Ok(Self::UserProfiles),
            _ => bail!("Unknown collection '{s}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Eq { field: String, value: Value },
    Neq { field: String, value: Value },
    /// Inclusive lower bound on an ISO date/timestamp field.
    Gte { field: String, value: String },
    /// Inclusive upper bound on an ISO date/timestamp field.
    Lte { field: String, value: String },
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn neq(field: &str, value: impl Into<Value>) -> Self {
        Self::Neq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn gte(field: &str, value: impl Into<String>) -> Self {
        Self::Gte {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn lte(field: &str, value: impl Into<String>) -> Self {
        Self::Lte {
            field: field.to_string(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Self::Eq { field, value } => row.get(field) == Some(value),
            Self::Neq { field, value } => row.get(field) != Some(value),
            Self::Gte { field, value } => row
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|v| v >= value.as_str()),
            Self::Lte { field, value } => row
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|v| v <= value.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order_desc(mut self, field: &str) -> Self {
        self.order_desc = Some(field.to_string());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate the query against an in-memory row set.
    pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut selected: Vec<Value> = rows
            .into_iter()
            .filter(|row| self.filters.iter().all(|f| f.matches(row)))
            .collect();
        if let Some(field) = &self.order_desc {
            selected.sort_by(|a, b| compare_field(b, a, field));
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

fn compare_field(a: &Value, b: &Value, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// Networked collection service. Implementations are expected to be slow and
/// fallible; callers treat every error as transient.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, collection: Collection, query: &Query) -> Result<Vec<Value>>;

    async fn insert(&self, collection: Collection, rows: &[Value]) -> Result<()>;

    /// Merge `patch` (an object) into every row matching all `filters`.
    /// Returns the number of rows touched.
    async fn update(&self, collection: Collection, filters: &[Filter], patch: &Value)
    -> Result<u64>;

    /// Insert or replace rows, matching existing rows on `conflict_keys`.
    async fn upsert(
        &self,
        collection: Collection,
        rows: &[Value],
        conflict_keys: &[&str],
    ) -> Result<()>;

    async fn delete(&self, collection: Collection, filters: &[Filter]) -> Result<u64>;
}

// --- Wire types shared by the HTTP client and server ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsPayload {
    pub rows: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    #[serde(default)]
    pub filters: Vec<Filter>,
    pub patch: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertPayload {
    pub rows: Vec<Value>,
    #[serde(default)]
    pub conflict_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersPayload {
    #[serde(default)]
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectedPayload {
    pub affected: u64,
}

// --- Database-backed store ---

pub struct HostedStore {
    db: Mutex<Database>,
}

impl HostedStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&db)
    }

    fn select_sync(&self, collection: Collection, query: &Query) -> Result<Vec<Value>> {
        self.with_db(|db| {
            let rows = db
                .list_documents(collection.as_str())?
                .into_iter()
                .map(|(_, body)| body);
            Ok(query.apply(rows))
        })
    }

    fn insert_sync(&self, collection: Collection, rows: &[Value]) -> Result<()> {
        self.with_db(|db| {
            for row in rows {
                let (id, body) = with_row_id(row)?;
                db.put_document(collection.as_str(), &id, &body)?;
            }
            Ok(())
        })
    }

    fn update_sync(&self, collection: Collection, filters: &[Filter], patch: &Value) -> Result<u64> {
        let Some(patch) = patch.as_object() else {
            bail!("Update patch must be a JSON object");
        };
        self.with_db(|db| {
            let mut touched = 0;
            for (id, mut body) in db.list_documents(collection.as_str())? {
                if !filters.iter().all(|f| f.matches(&body)) {
                    continue;
                }
                if let Some(fields) = body.as_object_mut() {
                    for (key, value) in patch {
                        if key != "id" {
                            fields.insert(key.clone(), value.clone());
                        }
                    }
                }
                db.put_document(collection.as_str(), &id, &body)?;
                touched += 1;
            }
            Ok(touched)
        })
    }

    fn upsert_sync(&self, collection: Collection, rows: &[Value], conflict_keys: &[&str]) -> Result<()> {
        self.with_db(|db| {
            for row in rows {
                let existing = if conflict_keys.is_empty() {
                    None
                } else {
                    db.list_documents(collection.as_str())?
                        .into_iter()
                        .find(|(_, body)| {
                            conflict_keys
                                .iter()
                                .all(|key| body.get(*key) == row.get(*key))
                        })
                        .map(|(id, _)| id)
                };

                let (id, mut body) = with_row_id(row)?;
                match existing {
                    // The stored row keeps its id; the rest of the row is replaced.
                    Some(existing_id) => {
                        body["id"] = Value::String(existing_id.clone());
                        db.put_document(collection.as_str(), &existing_id, &body)?;
                    }
                    None => db.put_document(collection.as_str(), &id, &body)?,
                }
            }
            Ok(())
        })
    }

    fn delete_sync(&self, collection: Collection, filters: &[Filter]) -> Result<u64> {
        self.with_db(|db| {
            let mut removed = 0;
            for (id, body) in db.list_documents(collection.as_str())? {
                if filters.iter().all(|f| f.matches(&body)) && db.delete_document(collection.as_str(), &id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}

/// Ensure a row is an object with a non-empty string `id`.
fn with_row_id(row: &Value) -> Result<(String, Value)> {
    let Some(fields) = row.as_object() else {
        bail!("Rows must be JSON objects");
    };
    let mut body = row.clone();
    let id = match fields.get("id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => {
            let id = Uuid::new_v4().to_string();
            body["id"] = Value::String(id.clone());
            id
        }
    };
    Ok((id, body))
}

#[async_trait]
impl RemoteStore for HostedStore {
    async fn select(&self, collection: Collection, query: &Query) -> Result<Vec<Value>> {
        self.select_sync(collection, query)
    }

    async fn insert(&self, collection: Collection, rows: &[Value]) -> Result<()> {
        self.insert_sync(collection, rows)
    }

    async fn update(
        &self,
        collection: Collection,
        filters: &[Filter],
        patch: &Value,
    ) -> Result<u64> {
        self.update_sync(collection, filters, patch)
    }

    async fn upsert(
        &self,
        collection: Collection,
        rows: &[Value],
        conflict_keys: &[&str],
    ) -> Result<()> {
        self.upsert_sync(collection, rows, conflict_keys)
    }

    async fn delete(&self, collection: Collection, filters: &[Filter]) -> Result<u64> {
        self.delete_sync(collection, filters)
    }
}
