use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::LocalCache;
use crate::models::{
    BodyMetrics, Completion, DayBucket, Gender, Identity, MealCompletion, MealStats, MealType,
    ProfileFragment, StatsWindow, WorkoutCompletion, WorkoutDetails, WorkoutStats,
    canonical_day_name, day_name_for, validate_meal_type, weekday_name,
};
use crate::remote::{Collection, Filter, Query, RemoteStore};
use crate::validation::{RequiredFields, is_valid_completion};

pub const SESSION_KEY: &str = "session";
pub const PROFILE_KEY: &str = "profile";

pub const DEFAULT_WEIGHT_KG: f64 = 70.0;

/// Cache key of the profile fragment cached for an authenticated account.
#[must_use]
pub fn account_profile_key(account: &str) -> String {
    format!("{PROFILE_KEY}:{account}")
}

/// Outcome of the best-effort remote mirror that follows every local write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RemoteWrite {
    Confirmed,
    /// Offline, unauthenticated, or the record is not uploadable.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Marked<T> {
    pub record: T,
    pub remote: RemoteWrite,
}

// --- Stored completion lists ---

/// Decode the cached list for `C`, skipping entries that no longer decode.
pub fn load_records<C: Completion>(cache: &LocalCache) -> Vec<C> {
    let rows: Vec<Value> = cache.get_or_default(C::KIND.cache_key());
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(kind = C::KIND.label(), error = %e, "dropping undecodable cached record");
                None
            }
        })
        .collect()
}

pub fn store_records<C: Completion>(cache: &LocalCache, records: &[C]) -> Result<()> {
    cache
        .set(C::KIND.cache_key(), records)
        .with_context(|| format!("Failed to save {}", C::KIND.label()))
}

/// Most recent `completed_at` first.
pub fn sort_newest_first<C: Completion>(records: &mut [C]) {
    records.sort_by(|a, b| {
        if a.is_newer_than(b) {
            Ordering::Less
        } else if b.is_newer_than(a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    });
}

// --- Calorie estimate ---

/// Energy cost per kilogram per hour for a named activity.
fn activity_coefficient(activity: &str) -> f64 {
    match activity.trim().to_lowercase().as_str() {
        "running" | "run" => 9.8,
        "cycling" | "bike" => 7.5,
        "swimming" | "hiit" => 8.0,
        "walking" | "walk" => 3.8,
        "rowing" => 7.0,
        "dance" | "dancing" => 5.5,
        "boxing" => 7.8,
        "yoga" | "pilates" | "stretching" => 3.0,
        _ => 5.0,
    }
}

#[must_use]
pub fn estimate_calories(details: &WorkoutDetails, metrics: &BodyMetrics) -> f64 {
    let weight = metrics
        .weight_kg
        .filter(|w| *w > 0.0)
        .unwrap_or(DEFAULT_WEIGHT_KG);
    let hours = details.duration_minutes.max(0.0) / 60.0;
    let mut calories = activity_coefficient(&details.activity_type) * weight * hours;

    match metrics.gender {
        Some(Gender::Male) => calories *= 1.1,
        Some(Gender::Female) => calories *= 0.9,
        Some(Gender::Other) | None => {}
    }
    match metrics.age {
        Some(age) if age > 50 => calories *= 0.9,
        Some(age) if age < 30 => calories *= 1.1,
        _ => {}
    }

    calories.round()
}

// --- Streaks and stats helpers ---

/// Consecutive days ending today or yesterday. Dates after `today` are
/// ignored.
#[must_use]
pub fn current_streak(dates: &BTreeSet<NaiveDate>, today: NaiveDate) -> u32 {
    let mut descending = dates.iter().rev().skip_while(|d| **d > today);
    let Some(&first) = descending.next() else {
        return 0;
    };
    if first != today && first != today - Duration::days(1) {
        return 0;
    }

    let mut streak = 1;
    let mut previous = first;
    for &date in descending {
        if date == previous - Duration::days(1) {
            streak += 1;
            previous = date;
        } else {
            break;
        }
    }
    streak
}

#[must_use]
pub fn longest_streak(dates: &BTreeSet<NaiveDate>) -> u32 {
    let mut longest = 0;
    let mut run = 0;
    let mut previous: Option<NaiveDate> = None;
    for &date in dates {
        run = match previous {
            Some(p) if date == p + Duration::days(1) => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        previous = Some(date);
    }
    longest
}

/// `per_week` sessions spread over `days`, rounded to the nearest whole one.
#[must_use]
pub fn expected_workouts(per_week: u32, days: i64) -> u32 {
    let expected = (i64::from(per_week) * days.max(0) + 3) / 7;
    u32::try_from(expected).unwrap_or(u32::MAX)
}

#[must_use]
pub fn completion_rate(total: u32, expected: u32) -> f64 {
    (f64::from(total) / f64::from(expected.max(1))).min(1.0)
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// One zero-initialized bucket per day of the window, then counted.
fn day_buckets(window: StatsWindow, dates: impl Iterator<Item = NaiveDate>) -> Vec<DayBucket> {
    let mut counts: BTreeMap<NaiveDate, u32> = window.dates().map(|d| (d, 0)).collect();
    for date in dates {
        if let Some(slot) = counts.get_mut(&date) {
            *slot += 1;
        }
    }

    let weekly = window.days() <= 7;
    counts
        .into_iter()
        .map(|(date, count)| DayBucket {
            label: if weekly {
                weekday_name(date).to_string()
            } else {
                date.to_string()
            },
            date: date.to_string(),
            count,
        })
        .collect()
}

fn streak_dates<'a, C: Completion + 'a>(
    records: impl IntoIterator<Item = &'a C>,
    today: NaiveDate,
) -> BTreeSet<NaiveDate> {
    records
        .into_iter()
        .filter_map(|r| r.date())
        .filter(|d| *d <= today)
        .collect()
}

/// Workout stats over `records` (already narrowed to one user).
#[must_use]
pub fn workout_stats_from(
    records: &[WorkoutCompletion],
    window: StatsWindow,
    per_week: u32,
    today: NaiveDate,
) -> WorkoutStats {
    let in_window: Vec<&WorkoutCompletion> = records
        .iter()
        .filter(|r| r.date().is_some_and(|d| window.contains(d)))
        .collect();
    let all_dates = streak_dates(records, today);

    let total = count(in_window.len());
    let expected = expected_workouts(per_week, window.days());

    WorkoutStats {
        window,
        total_workouts: total,
        expected_workouts: expected,
        completion_rate: completion_rate(total, expected),
        current_streak: current_streak(&all_dates, today),
        longest_streak: longest_streak(&all_dates),
        total_calories_burned: in_window.iter().map(|r| r.estimated_calories_burned).sum(),
        last_completed: in_window
            .iter()
            .filter_map(|r| r.date())
            .max()
            .map(|d| d.to_string()),
        days: day_buckets(window, in_window.iter().filter_map(|r| r.date())),
    }
}

/// Meal stats over `records` (already narrowed to one user). Three meals a
/// day are expected.
#[must_use]
pub fn meal_stats_from(
    records: &[MealCompletion],
    window: StatsWindow,
    today: NaiveDate,
) -> MealStats {
    let in_window: Vec<&MealCompletion> = records
        .iter()
        .filter(|r| r.date().is_some_and(|d| window.contains(d)))
        .collect();
    let all_dates = streak_dates(records, today);

    let total = count(in_window.len());
    let expected = u32::try_from(window.days() * 3).unwrap_or(u32::MAX);

    let mut by_type: BTreeMap<MealType, u32> = MealType::ALL.iter().map(|t| (*t, 0)).collect();
    for record in &in_window {
        if let Some(meal_type) = MealType::parse(&record.meal_type) {
            *by_type.entry(meal_type).or_insert(0) += 1;
        }
    }

    MealStats {
        window,
        total_meals: total,
        expected_meals: expected,
        completion_rate: completion_rate(total, expected),
        current_streak: current_streak(&all_dates, today),
        longest_streak: longest_streak(&all_dates),
        last_completed: in_window
            .iter()
            .filter_map(|r| r.date())
            .max()
            .map(|d| d.to_string()),
        by_type,
        days: day_buckets(window, in_window.iter().filter_map(|r| r.date())),
    }
}

// --- Service ---

/// Records completions locally, mirrors them to the remote store when it
/// can, and answers completion and stats queries.
pub struct TrackingService<'a> {
    cache: &'a LocalCache,
    remote: Option<&'a dyn RemoteStore>,
    pinned_today: Option<NaiveDate>,
}

impl<'a> TrackingService<'a> {
    #[must_use]
    pub fn new(cache: &'a LocalCache) -> Self {
        Self {
            cache,
            remote: None,
            pinned_today: None,
        }
    }

    #[must_use]
    pub fn with_remote(mut self, remote: &'a dyn RemoteStore) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Evaluate "today" as `today` instead of the local clock.
    #[must_use]
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.pinned_today = Some(today);
        self
    }

    #[must_use]
    pub fn today(&self) -> NaiveDate {
        self.pinned_today
            .unwrap_or_else(|| Local::now().date_naive())
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    // --- Session and profile ---

    #[must_use]
    pub fn session(&self) -> Identity {
        self.cache.get_or_default(SESSION_KEY)
    }

    pub fn set_session(&self, identity: &Identity) -> Result<()> {
        match identity {
            Identity::Local => self.cache.remove(SESSION_KEY),
            Identity::Authenticated(_) => self
                .cache
                .set(SESSION_KEY, identity)
                .context("Failed to save session")?,
        }
        Ok(())
    }

    /// The account's cached fragment, falling back to the device-local one.
    #[must_use]
    pub fn profile(&self, user: &Identity) -> ProfileFragment {
        if let Some(account) = user.account_id() {
            let key = account_profile_key(account);
            if self.cache.has(&key) {
                return self.cache.get_or_default(&key);
            }
        }
        self.cache.get_or_default(PROFILE_KEY)
    }

    pub fn save_profile(&self, user: &Identity, mut fragment: ProfileFragment) -> Result<ProfileFragment> {
        fragment.user_id = user.clone();
        fragment.updated_at = Utc::now().to_rfc3339();
        let key = match user.account_id() {
            Some(account) => account_profile_key(account),
            None => PROFILE_KEY.to_string(),
        };
        self.cache
            .set(&key, &fragment)
            .context("Failed to save profile")?;
        Ok(fragment)
    }

    #[must_use]
    pub fn body_metrics(&self, user: &Identity) -> BodyMetrics {
        self.profile(user).body_metrics()
    }

    // --- Workouts ---

    pub async fn mark_workout_complete(
        &self,
        user: &Identity,
        date: NaiveDate,
        day_number: i64,
        plan_id: Option<&str>,
        details: &WorkoutDetails,
    ) -> Result<Marked<WorkoutCompletion>> {
        let metrics = self.body_metrics(user);
        let record = WorkoutCompletion {
            id: Uuid::new_v4().to_string(),
            user_id: user.clone(),
            workout_date: date.format("%Y-%m-%d").to_string(),
            day_number,
            workout_day_name: day_name_for(day_number, date).to_string(),
            workout_plan_id: plan_id.map(str::to_string),
            completed_at: Utc::now().to_rfc3339(),
            estimated_calories_burned: estimate_calories(details, &metrics),
        };

        let record = self.upsert_local(record)?;
        let remote = self.mirror(&record).await;
        Ok(Marked { record, remote })
    }

    /// Whether `user` completed a workout on `date` (optionally for a given
    /// day name). Local records answer first; an authenticated user with a
    /// remote falls back to the remote store and backfills a hit.
    pub async fn is_workout_completed(
        &self,
        user: &Identity,
        date: NaiveDate,
        day_name: Option<&str>,
    ) -> bool {
        let slot = day_name.map(canonical_day_name);
        self.is_completed::<WorkoutCompletion>(user, date, slot.as_deref())
            .await
    }

    #[must_use]
    pub fn workout_completions(&self, user: &Identity) -> Vec<WorkoutCompletion> {
        self.completions_for(user)
    }

    #[must_use]
    pub fn get_workout_stats(
        &self,
        user: &Identity,
        window: StatsWindow,
        per_week: u32,
    ) -> WorkoutStats {
        workout_stats_from(&self.workout_completions(user), window, per_week, self.today())
    }

    // --- Meals ---

    pub async fn mark_meal_complete(
        &self,
        user: &Identity,
        date: NaiveDate,
        meal_type: &str,
        plan_id: Option<&str>,
    ) -> Result<Marked<MealCompletion>> {
        let meal_type = validate_meal_type(meal_type)?;
        let record = MealCompletion {
            id: Uuid::new_v4().to_string(),
            user_id: user.clone(),
            meal_date: date.format("%Y-%m-%d").to_string(),
            meal_type: meal_type.as_str().to_string(),
            meal_plan_id: plan_id.map(str::to_string),
            completed_at: Utc::now().to_rfc3339(),
        };

        let record = self.upsert_local(record)?;
        let remote = self.mirror(&record).await;
        Ok(Marked { record, remote })
    }

    pub async fn is_meal_completed(&self, user: &Identity, date: NaiveDate, meal_type: &str) -> bool {
        let slot = MealType::parse(meal_type)
            .map_or_else(|| meal_type.trim().to_lowercase(), |t| t.as_str().to_string());
        self.is_completed::<MealCompletion>(user, date, Some(&slot))
            .await
    }

    #[must_use]
    pub fn meal_completions(&self, user: &Identity) -> Vec<MealCompletion> {
        self.completions_for(user)
    }

    #[must_use]
    pub fn get_meal_stats(&self, user: &Identity, window: StatsWindow) -> MealStats {
        meal_stats_from(&self.meal_completions(user), window, self.today())
    }

    // --- Maintenance ---

    /// Delete every completion owned by `user`, locally and (for an
    /// authenticated user) remotely. Returns the number of local records
    /// removed.
    ///
    /// Ownership here is exact, not the permissive lookup match: records of
    /// other accounts are never touched. An account's reset also drops the
    /// unclaimed placeholder records its lookups were showing.
    pub async fn clear_completions(&self, user: &Identity) -> Result<usize> {
        let removed =
            self.clear_local::<WorkoutCompletion>(user)? + self.clear_local::<MealCompletion>(user)?;

        if let (Some(account), Some(remote)) = (user.account_id(), self.remote) {
            for collection in [Collection::WorkoutCompletions, Collection::MealCompletions] {
                let deleted = remote
                    .delete(collection, &[Filter::eq("user_id", account)])
                    .await
                    .with_context(|| format!("Failed to clear remote {collection}"))?;
                debug!(%collection, deleted, "cleared remote completions");
            }
        }

        Ok(removed)
    }

    // --- Shared internals ---

    fn completions_for<C: Completion>(&self, user: &Identity) -> Vec<C> {
        let mut records: Vec<C> = load_records::<C>(self.cache)
            .into_iter()
            .filter(|r| r.user().matches(user))
            .collect();
        sort_newest_first(&mut records);
        records
    }

    /// Replace every record in the new record's slot, keeping the id already
    /// stored for it, or append; then re-sort.
    fn upsert_local<C: Completion>(&self, mut record: C) -> Result<C> {
        let mut records = load_records::<C>(self.cache);
        let mut existing_id = None;
        records.retain(|r| {
            if r.same_slot(&record) {
                existing_id.get_or_insert_with(|| r.id().to_string());
                false
            } else {
                true
            }
        });
        if let Some(id) = existing_id {
            record.set_id(id);
        }
        records.push(record.clone());
        sort_newest_first(&mut records);
        store_records(self.cache, &records)?;
        Ok(record)
    }

    async fn mirror<C>(&self, record: &C) -> RemoteWrite
    where
        C: Completion + RequiredFields,
    {
        if !record.user().is_authenticated() {
            return RemoteWrite::Skipped;
        }
        let Some(remote) = self.remote else {
            return RemoteWrite::Skipped;
        };
        let check = is_valid_completion(record, self.today());
        if !check.valid {
            debug!(id = record.id(), reasons = ?check.reasons, "not mirroring record");
            return RemoteWrite::Skipped;
        }

        let collection = C::KIND.collection();
        let row = match serde_json::to_value(record) {
            Ok(row) => row,
            Err(e) => return RemoteWrite::Failed(e.to_string()),
        };
        match remote
            .upsert(collection, &[row], collection.conflict_keys())
            .await
        {
            Ok(()) => RemoteWrite::Confirmed,
            Err(e) => {
                let reason = format!("{e:#}");
                warn!(%collection, id = record.id(), error = %reason, "remote mirror failed");
                RemoteWrite::Failed(reason)
            }
        }
    }

    async fn is_completed<C: Completion>(
        &self,
        user: &Identity,
        date: NaiveDate,
        slot: Option<&str>,
    ) -> bool {
        let in_slot = |record: &C| slot.is_none_or(|s| record.slot().trim().eq_ignore_ascii_case(s));

        let found_locally = load_records::<C>(self.cache)
            .iter()
            .any(|r| r.user().matches(user) && r.date() == Some(date) && in_slot(r));
        if found_locally {
            return true;
        }

        let (Some(account), Some(remote)) = (user.account_id(), self.remote) else {
            return false;
        };

        let kind = C::KIND;
        let mut query = Query::new()
            .filter(Filter::eq("user_id", account))
            .filter(Filter::eq(kind.date_field(), date.format("%Y-%m-%d").to_string()))
            .limit(1);
        if let Some(slot) = slot {
            query = query.filter(Filter::eq(kind.slot_field(), slot));
        }

        let rows = match remote.select(kind.collection(), &query).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(kind = kind.label(), error = %format!("{e:#}"), "remote lookup failed");
                return false;
            }
        };
        let Some(row) = rows.into_iter().next() else {
            return false;
        };
        match serde_json::from_value::<C>(row) {
            Ok(record) => {
                self.backfill(record);
                true
            }
            Err(e) => {
                warn!(kind = kind.label(), error = %e, "undecodable remote record");
                false
            }
        }
    }

    /// Store a record fetched from the remote unless a newer local one
    /// already holds its slot.
    fn backfill<C: Completion>(&self, fetched: C) {
        let mut records = load_records::<C>(self.cache);
        match records.iter().position(|r| r.same_slot(&fetched)) {
            Some(pos) if !fetched.is_newer_than(&records[pos]) => return,
            Some(pos) => records[pos] = fetched,
            None => records.push(fetched),
        }
        sort_newest_first(&mut records);
        if let Err(e) = store_records(self.cache, &records) {
            warn!(error = %format!("{e:#}"), "could not backfill remote record");
        }
    }

    fn clear_local<C: Completion>(&self, user: &Identity) -> Result<usize> {
        let mut records = load_records::<C>(self.cache);
        let before = records.len();
        records.retain(|r| r.user() != user && r.user().is_authenticated());
        let removed = before - records.len();
        if removed > 0 {
            store_records(self.cache, &records)?;
        }
        Ok(removed)
    }
}
