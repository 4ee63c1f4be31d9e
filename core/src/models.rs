use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::remote::Collection;

/// Wire value of `user_id` for records created before the user signed in.
pub const LOCAL_USER_ID: &str = "local_user";

pub const MEAL_TYPES: &[&str] = &["breakfast", "lunch", "dinner", "snack"];

pub const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

// --- Identity ---

/// Owner of a completion record.
///
/// Serialized as the bare `user_id` string; [`LOCAL_USER_ID`] (or an empty
/// string) maps to [`Identity::Local`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Identity {
    #[default]
    Local,
    Authenticated(String),
}

impl Identity {
    #[must_use]
    pub fn authenticated(account_id: impl Into<String>) -> Self {
        let account_id = account_id.into();
        Self::from(account_id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Local => LOCAL_USER_ID,
            Self::Authenticated(id) => id,
        }
    }

    #[must_use]
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Authenticated(id) => Some(id),
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    /// Ownership test used by every lookup. A device-local record matches any
    /// identity (and vice versa) so that records survive the login transition;
    /// two authenticated identities match only when the account ids are equal.
    #[must_use]
    pub fn matches(&self, other: &Identity) -> bool {
        match (self, other) {
            (Self::Local, _) | (_, Self::Local) => true,
            (Self::Authenticated(a), Self::Authenticated(b)) => a == b,
        }
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed == LOCAL_USER_ID {
            Self::Local
        } else {
            Self::Authenticated(trimmed.to_string())
        }
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        match value {
            Identity::Local => LOCAL_USER_ID.to_string(),
            Identity::Authenticated(id) => id,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Completion records ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: Identity,
    #[serde(default)]
    pub workout_date: String,
    #[serde(default)]
    pub day_number: i64,
    #[serde(default)]
    pub workout_day_name: String,
    #[serde(default)]
    pub workout_plan_id: Option<String>,
    #[serde(default)]
    pub completed_at: String,
    #[serde(default)]
    pub estimated_calories_burned: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: Identity,
    #[serde(default)]
    pub meal_date: String,
    #[serde(default)]
    pub meal_type: String,
    #[serde(default)]
    pub meal_plan_id: Option<String>,
    #[serde(default)]
    pub completed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Workout,
    Meal,
}

impl CompletionKind {
    /// Local Cache key holding the full list for this kind.
    #[must_use]
    pub fn cache_key(self) -> &'static str {
        match self {
            Self::Workout => "workout_completions",
            Self::Meal => "meal_completions",
        }
    }

    #[must_use]
    pub fn collection(self) -> Collection {
        match self {
            Self::Workout => Collection::WorkoutCompletions,
            Self::Meal => Collection::MealCompletions,
        }
    }

    #[must_use]
    pub fn date_field(self) -> &'static str {
        match self {
            Self::Workout => "workout_date",
            Self::Meal => "meal_date",
        }
    }

    /// Column naming the slot within a day.
    #[must_use]
    pub fn slot_field(self) -> &'static str {
        match self {
            Self::Workout => "workout_day_name",
            Self::Meal => "meal_type",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Workout => "workouts",
            Self::Meal => "meals",
        }
    }
}

/// Behaviour shared by workout and meal completions: ownership, the
/// uniqueness slot `(user_id, date, slot)` and recency.
pub trait Completion: Clone + Serialize + DeserializeOwned + Send + Sync {
    const KIND: CompletionKind;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn user(&self) -> &Identity;
    fn set_user(&mut self, user: Identity);
    fn date_str(&self) -> &str;
    /// Workout day name or meal type.
    fn slot(&self) -> &str;
    fn completed_at(&self) -> &str;

    fn date(&self) -> Option<NaiveDate> {
        parse_record_date(self.date_str())
    }

    /// Owner-independent part of the uniqueness key. The date is reduced to
    /// its calendar day so a timestamp-shaped date shares a slot with the
    /// plain `YYYY-MM-DD` form.
    fn slot_key(&self) -> (String, String) {
        let day = self.date().map_or_else(
            || self.date_str().trim().to_string(),
            |d| d.format("%Y-%m-%d").to_string(),
        );
        (day, self.slot().trim().to_lowercase())
    }

    /// Same uniqueness slot, with permissive identity matching.
    fn same_slot(&self, other: &Self) -> bool {
        self.user().matches(other.user()) && self.slot_key() == other.slot_key()
    }

    fn is_newer_than(&self, other: &Self) -> bool {
        is_newer(self.completed_at(), other.completed_at())
    }
}

impl Completion for WorkoutCompletion {
    const KIND: CompletionKind = CompletionKind::Workout;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn user(&self) -> &Identity {
        &self.user_id
    }

    fn set_user(&mut self, user: Identity) {
        self.user_id = user;
    }

    fn date_str(&self) -> &str {
        &self.workout_date
    }

    fn slot(&self) -> &str {
        &self.workout_day_name
    }

    fn completed_at(&self) -> &str {
        &self.completed_at
    }
}

impl Completion for MealCompletion {
    const KIND: CompletionKind = CompletionKind::Meal;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn user(&self) -> &Identity {
        &self.user_id
    }

    fn set_user(&mut self, user: Identity) {
        self.user_id = user;
    }

    fn date_str(&self) -> &str {
        &self.meal_date
    }

    fn slot(&self) -> &str {
        &self.meal_type
    }

    fn completed_at(&self) -> &str {
        &self.completed_at
    }
}

/// Parse a stored calendar date. Accepts `YYYY-MM-DD` and timestamps that
/// start with one (some older rows carry a full ISO timestamp).
#[must_use]
pub fn parse_record_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let date_part = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Strict recency: `a` wins only when it is later than `b`. Unparsable
/// timestamps lose to parsable ones; two unparsable values compare as text.
#[must_use]
pub fn is_newer(a: &str, b: &str) -> bool {
    match (parse_timestamp(a), parse_timestamp(b)) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => a > b,
    }
}

// --- Meal types and day names ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
}

impl MealType {
    pub const ALL: [MealType; 4] = [Self::Breakfast, Self::Lunch, Self::Dinner, Self::Snack];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "breakfast" => Some(Self::Breakfast),
            "lunch" => Some(Self::Lunch),
            "dinner" => Some(Self::Dinner),
            "snack" => Some(Self::Snack),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Breakfast => "breakfast",
            Self::Lunch => "lunch",
            Self::Dinner => "dinner",
            Self::Snack => "snack",
        }
    }
}

impl fmt::Display for MealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn validate_meal_type(meal: &str) -> Result<MealType> {
    match MealType::parse(meal) {
        Some(meal_type) => Ok(meal_type),
        None => bail!(
            "Invalid meal type '{meal}'. Must be one of: {}",
            MEAL_TYPES.join(", ")
        ),
    }
}

#[must_use]
pub fn weekday_name(date: NaiveDate) -> &'static str {
    WEEKDAY_NAMES[date.weekday().num_days_from_monday() as usize]
}

/// Day name for a plan day: 1..=7 map to Monday..Sunday, anything else falls
/// back to the weekday of `date`.
#[must_use]
pub fn day_name_for(day_number: i64, date: NaiveDate) -> &'static str {
    match usize::try_from(day_number) {
        Ok(n @ 1..=7) => WEEKDAY_NAMES[n - 1],
        _ => weekday_name(date),
    }
}

/// Canonical capitalization for a weekday label ("monday" -> "Monday").
/// Labels that are not weekdays are returned trimmed but otherwise untouched.
#[must_use]
pub fn canonical_day_name(value: &str) -> String {
    let trimmed = value.trim();
    WEEKDAY_NAMES
        .iter()
        .find(|name| name.eq_ignore_ascii_case(trimmed))
        .map_or_else(|| trimmed.to_string(), |name| (*name).to_string())
}

// --- Workout inputs ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutDetails {
    pub activity_type: String,
    pub duration_minutes: f64,
}

impl Default for WorkoutDetails {
    fn default() -> Self {
        Self {
            activity_type: "general".to_string(),
            duration_minutes: 45.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "male" | "m" => Some(Self::Male),
            "female" | "f" => Some(Self::Female),
            "other" | "x" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BodyMetrics {
    pub weight_kg: Option<f64>,
    pub gender: Option<Gender>,
    pub age: Option<u32>,
}

// --- Profile fragment ---

/// A plan attached to the profile. It carries its own timestamp so a newer
/// plan can win even when the surrounding profile is older.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPayload {
    pub plan_id: String,
    pub updated_at: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileFragment {
    #[serde(default)]
    pub user_id: Identity,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub fitness_goal: Option<String>,
    #[serde(default)]
    pub workout_plan: Option<PlanPayload>,
    #[serde(default)]
    pub meal_plan: Option<PlanPayload>,
}

impl ProfileFragment {
    #[must_use]
    pub fn body_metrics(&self) -> BodyMetrics {
        BodyMetrics {
            weight_kg: self.weight_kg,
            gender: self.gender,
            age: self.age,
        }
    }
}

// --- Stats ---

/// Inclusive calendar window used by the stats queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl StatsWindow {
    /// The `days` calendar days ending at `today` (a zero-day window is
    /// treated as one day).
    #[must_use]
    pub fn last_days(days: u32, today: NaiveDate) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start: today - chrono::Duration::days(span),
            end: today,
        }
    }

    #[must_use]
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(|d| *d <= self.end)
    }
}

/// One bar in a calendar or chart: a weekday label for windows of up to a
/// week, the ISO date otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayBucket {
    pub label: String,
    pub date: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkoutStats {
    pub window: StatsWindow,
    pub total_workouts: u32,
    pub expected_workouts: u32,
    pub completion_rate: f64,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub total_calories_burned: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<String>,
    pub days: Vec<DayBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MealStats {
    pub window: StatsWindow,
    pub total_meals: u32,
    pub expected_meals: u32,
    pub completion_rate: f64,
    pub current_streak: u32,
    pub longest_streak: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<String>,
    pub by_type: BTreeMap<MealType, u32>,
    pub days: Vec<DayBucket>,
}
