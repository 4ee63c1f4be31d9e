//! Sync Reconciler: merges the cached completion lists and profile fragment
//! with the remote copy after a login or reconnect.
//!
//! Each kind (workouts, meals, profile) walks
//! `Idle -> Fetching -> Merging -> Uploading -> Writeback -> Idle` on its own;
//! a failure parks that kind in `Failed` and the next kind still runs. The
//! local list is only rewritten once the upload for that kind succeeded, so
//! an aborted run leaves the cache as it was.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::LocalCache;
use crate::models::{
    Completion, Identity, MealCompletion, PlanPayload, ProfileFragment, WorkoutCompletion,
    is_newer,
};
use crate::remote::{Collection, Filter, Query, RemoteStore};
use crate::service::{PROFILE_KEY, account_profile_key, load_records, sort_newest_first, store_records};
use crate::validation::{RequiredFields, filter_valid, within_sync_window};

const PROFILE_LABEL: &str = "profile";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
    Merging,
    Uploading,
    Writeback,
    Failed(String),
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Fetching => f.write_str("fetching"),
            Self::Merging => f.write_str("merging"),
            Self::Uploading => f.write_str("uploading"),
            Self::Writeback => f.write_str("writeback"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    /// `Idle` when the kind reconciled, `Failed` otherwise.
    pub state: SyncState,
    pub fetched: usize,
    /// Records in the merged set written back to the cache.
    pub merged: usize,
    pub uploaded: usize,
    /// Local records kept out of the merge or the upload by validation.
    pub rejected: usize,
    /// Records whose device-local owner was replaced by the account.
    pub rewritten: usize,
}

impl KindReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == SyncState::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub account: String,
    pub workouts: KindReport,
    pub meals: KindReport,
    pub profile: KindReport,
}

impl SyncReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.workouts.succeeded() && self.meals.succeeded() && self.profile.succeeded()
    }
}

pub struct Reconciler<'a> {
    cache: &'a LocalCache,
    remote: &'a dyn RemoteStore,
    state: Mutex<SyncState>,
}

impl<'a> Reconciler<'a> {
    #[must_use]
    pub fn new(cache: &'a LocalCache, remote: &'a dyn RemoteStore) -> Self {
        Self {
            cache,
            remote,
            state: Mutex::new(SyncState::Idle),
        }
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, kind: &str, next: SyncState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *state, next);
        debug!(kind, from = %previous, to = %state, "sync state");
    }

    /// Reconcile against the device's local date.
    pub async fn reconcile(&self, user: &Identity) -> Result<SyncReport> {
        self.reconcile_on(user, Local::now().date_naive()).await
    }

    /// Reconcile every kind for `user`. Only an unauthenticated `user` is an
    /// error; per-kind failures are reported in the returned [`SyncReport`].
    pub async fn reconcile_on(&self, user: &Identity, today: NaiveDate) -> Result<SyncReport> {
        let Some(account) = user.account_id() else {
            bail!("Reconciliation needs a signed-in account");
        };

        let workouts = self
            .reconcile_completions::<WorkoutCompletion>(user, account, today)
            .await;
        let workouts = self.finish(WorkoutCompletion::KIND.label(), workouts);

        let meals = self
            .reconcile_completions::<MealCompletion>(user, account, today)
            .await;
        let meals = self.finish(MealCompletion::KIND.label(), meals);

        let profile = self.reconcile_profile(user, account).await;
        let profile = self.finish(PROFILE_LABEL, profile);

        Ok(SyncReport {
            account: account.to_string(),
            workouts,
            meals,
            profile,
        })
    }

    fn finish(&self, kind: &str, result: Result<KindReport>) -> KindReport {
        match result {
            Ok(mut report) => {
                self.transition(kind, SyncState::Idle);
                report.state = SyncState::Idle;
                info!(
                    kind,
                    fetched = report.fetched,
                    merged = report.merged,
                    uploaded = report.uploaded,
                    rejected = report.rejected,
                    rewritten = report.rewritten,
                    "reconciled"
                );
                report
            }
            Err(e) => {
                let reason = format!("{e:#}");
                warn!(kind, error = %reason, "reconciliation failed; local data left unchanged");
                self.transition(kind, SyncState::Failed(reason.clone()));
                self.transition(kind, SyncState::Idle);
                KindReport {
                    state: SyncState::Failed(reason),
                    ..KindReport::default()
                }
            }
        }
    }

    async fn reconcile_completions<C>(
        &self,
        user: &Identity,
        account: &str,
        today: NaiveDate,
    ) -> Result<KindReport>
    where
        C: Completion + RequiredFields,
    {
        let kind = C::KIND;
        let collection = kind.collection();
        let mut report = KindReport::default();

        self.transition(kind.label(), SyncState::Fetching);
        let rows = self
            .remote
            .select(collection, &Query::new().filter(Filter::eq("user_id", account)))
            .await
            .with_context(|| format!("Failed to fetch remote {collection}"))?;
        let fetched: Vec<C> = decode_rows(rows, kind.label());
        report.fetched = fetched.len();

        self.transition(kind.label(), SyncState::Merging);
        // Keyed by the uniqueness slot so a record completed on two devices
        // merges even though each side minted its own id.
        let mut remote_by_slot: BTreeMap<(String, String), C> = BTreeMap::new();
        for record in fetched {
            insert_if_newer(&mut remote_by_slot, record);
        }
        let mut merged = remote_by_slot.clone();

        for mut record in load_records::<C>(self.cache) {
            if !record.user().matches(user) {
                continue;
            }
            if !record.date().is_some_and(|d| within_sync_window(d, today)) {
                report.rejected += 1;
                continue;
            }

            let slot = record.slot_key();
            if merged
                .get(&slot)
                .is_some_and(|current| !record.is_newer_than(current))
            {
                continue;
            }
            if !record.user().is_authenticated() {
                record.set_user(user.clone());
                report.rewritten += 1;
            }
            if let Some(remote) = remote_by_slot.get(&slot) {
                record.set_id(remote.id().to_string());
            }
            merged.insert(slot, record);
        }

        self.transition(kind.label(), SyncState::Uploading);
        let candidates: Vec<C> = merged
            .iter()
            .filter(|(slot, record)| {
                remote_by_slot
                    .get(*slot)
                    .is_none_or(|remote| record.is_newer_than(remote))
            })
            .map(|(_, record)| record.clone())
            .collect();
        let accepted = filter_valid(&candidates, today);
        report.rejected += candidates.len() - accepted.len();
        if !accepted.is_empty() {
            let rows = accepted
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<Value>, _>>()?;
            self.remote
                .upsert(collection, &rows, collection.conflict_keys())
                .await
                .with_context(|| format!("Failed to upload {collection}"))?;
        }
        report.uploaded = accepted.len();

        self.transition(kind.label(), SyncState::Writeback);
        report.merged = merged.len();
        // Re-read: records written while the upload was in flight must survive.
        // A cached record only replaces the merged one for its slot if newer.
        let mut records = Vec::new();
        for record in load_records::<C>(self.cache) {
            if record.user().matches(user) {
                insert_if_newer(&mut merged, record);
            } else {
                records.push(record);
            }
        }
        records.extend(merged.into_values());
        sort_newest_first(&mut records);
        store_records(self.cache, &records)?;

        Ok(report)
    }

    async fn reconcile_profile(&self, user: &Identity, account: &str) -> Result<KindReport> {
        let collection = Collection::UserProfiles;
        let mut report = KindReport::default();

        self.transition(PROFILE_LABEL, SyncState::Fetching);
        let rows = self
            .remote
            .select(
                collection,
                &Query::new()
                    .filter(Filter::eq("user_id", account))
                    .order_desc("updated_at")
                    .limit(1),
            )
            .await
            .context("Failed to fetch remote profile")?;
        let remote = decode_rows::<ProfileFragment>(rows, PROFILE_LABEL)
            .into_iter()
            .next();
        report.fetched = usize::from(remote.is_some());

        self.transition(PROFILE_LABEL, SyncState::Merging);
        let account_key = account_profile_key(account);
        let local = match self.cache.get_value(&account_key) {
            Some(value) => decode_value::<ProfileFragment>(value),
            None => self
                .cache
                .get_value(PROFILE_KEY)
                .and_then(decode_value::<ProfileFragment>),
        };
        if local.as_ref().is_some_and(|p| !p.user_id.is_authenticated()) {
            report.rewritten = 1;
        }

        let mut merged = match (local, remote.as_ref()) {
            (None, None) => return Ok(report),
            (Some(local), None) => local,
            (None, Some(remote)) => remote.clone(),
            (Some(local), Some(remote)) => merge_profiles(&local, remote),
        };
        merged.user_id = user.clone();
        report.merged = 1;

        self.transition(PROFILE_LABEL, SyncState::Uploading);
        if remote.as_ref() != Some(&merged) {
            let row = serde_json::to_value(&merged)?;
            self.remote
                .upsert(collection, &[row], collection.conflict_keys())
                .await
                .context("Failed to upload profile")?;
            report.uploaded = 1;
        }

        self.transition(PROFILE_LABEL, SyncState::Writeback);
        self.cache
            .set(&account_key, &merged)
            .context("Failed to save profile")?;

        Ok(report)
    }
}

fn decode_value<T: DeserializeOwned>(value: Value) -> Option<T> {
    serde_json::from_value(value).ok()
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>, label: &str) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(kind = label, error = %e, "skipping undecodable remote row");
                None
            }
        })
        .collect()
}

fn insert_if_newer<C: Completion>(map: &mut BTreeMap<(String, String), C>, record: C) {
    let slot = record.slot_key();
    match map.get(&slot) {
        Some(existing) if !record.is_newer_than(existing) => {}
        _ => {
            map.insert(slot, record);
        }
    }
}

/// Whole-fragment recency by `updated_at` (ties go to `remote`), then each
/// plan independently by its own `updated_at`.
#[must_use]
pub fn merge_profiles(local: &ProfileFragment, remote: &ProfileFragment) -> ProfileFragment {
    let mut merged = if is_newer(&local.updated_at, &remote.updated_at) {
        local.clone()
    } else {
        remote.clone()
    };
    merged.workout_plan = newer_plan(local.workout_plan.as_ref(), remote.workout_plan.as_ref());
    merged.meal_plan = newer_plan(local.meal_plan.as_ref(), remote.meal_plan.as_ref());
    merged
}

fn newer_plan(local: Option<&PlanPayload>, remote: Option<&PlanPayload>) -> Option<PlanPayload> {
    match (local, remote) {
        (Some(l), Some(r)) if is_newer(&l.updated_at, &r.updated_at) => Some(l.clone()),
        (_, Some(r)) => Some(r.clone()),
        (Some(l), None) => Some(l.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::remote::HostedStore;
    use crate::service::TrackingService;
    use async_trait::async_trait;
    use serde_json::json;

    /// Hosted store that can be told to fail one verb for one collection.
    struct ScriptedRemote {
        inner: HostedStore,
        fail_select: Option<Collection>,
        fail_upsert: Option<Collection>,
    }

    impl ScriptedRemote {
        fn healthy() -> Self {
            Self {
                inner: HostedStore::open_in_memory().unwrap(),
                fail_select: None,
                fail_upsert: None,
            }
        }
    }

    #[async_trait]
    impl RemoteStore for ScriptedRemote {
        async fn select(&self, collection: Collection, query: &Query) -> Result<Vec<Value>> {
            if self.fail_select == Some(collection) {
                bail!("network unreachable");
            }
            self.inner.select(collection, query).await
        }

        async fn insert(&self, collection: Collection, rows: &[Value]) -> Result<()> {
            self.inner.insert(collection, rows).await
        }

        async fn update(&self, collection: Collection, filters: &[Filter], patch: &Value) -> Result<u64> {
            self.inner.update(collection, filters, patch).await
        }

        async fn upsert(&self, collection: Collection, rows: &[Value], keys: &[&str]) -> Result<()> {
            if self.fail_upsert == Some(collection) {
                bail!("gateway timeout");
            }
            self.inner.upsert(collection, rows, keys).await
        }

        async fn delete(&self, collection: Collection, filters: &[Filter]) -> Result<u64> {
            self.inner.delete(collection, filters).await
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        date(2024, 1, 2)
    }

    fn new_cache() -> LocalCache {
        let cache = LocalCache::new(Database::open_in_memory().unwrap());
        cache.init();
        cache
    }

    fn u1() -> Identity {
        Identity::authenticated("U1")
    }

    fn meal(id: &str, user: Identity, day: &str, meal_type: &str, completed_at: &str) -> MealCompletion {
        MealCompletion {
            id: id.to_string(),
            user_id: user,
            meal_date: day.to_string(),
            meal_type: meal_type.to_string(),
            meal_plan_id: None,
            completed_at: completed_at.to_string(),
        }
    }

    fn workout(id: &str, user: Identity, day: &str, name: &str, completed_at: &str) -> WorkoutCompletion {
        WorkoutCompletion {
            id: id.to_string(),
            user_id: user,
            workout_date: day.to_string(),
            day_number: 0,
            workout_day_name: name.to_string(),
            workout_plan_id: None,
            completed_at: completed_at.to_string(),
            estimated_calories_burned: 200.0,
        }
    }

    async fn remote_rows(remote: &dyn RemoteStore, collection: Collection) -> Vec<Value> {
        remote.select(collection, &Query::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_login_rewrites_placeholder_identity() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        store_records(
            &cache,
            &[meal("m1", Identity::Local, "2024-01-01", "breakfast", "2024-01-01T08:00:00Z")],
        )
        .unwrap();

        let reconciler = Reconciler::new(&cache, &remote);
        let report = reconciler.reconcile_on(&u1(), today()).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.meals.rewritten, 1);
        assert_eq!(report.meals.uploaded, 1);

        let stored = load_records::<MealCompletion>(&cache);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].user_id, u1());

        let service = TrackingService::new(&cache).with_today(today());
        assert!(service.is_meal_completed(&u1(), date(2024, 1, 1), "breakfast").await);

        let rows = remote_rows(&remote, Collection::MealCompletions).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["user_id"], "U1");
    }

    #[tokio::test]
    async fn test_future_record_is_held_back_but_kept_locally() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        store_records(
            &cache,
            &[
                workout("w1", Identity::Local, "2024-01-03", "Wednesday", "2024-01-02T08:00:00Z"),
                workout("w2", Identity::Local, "2024-01-01", "Monday", "2024-01-01T08:00:00Z"),
            ],
        )
        .unwrap();

        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert_eq!(report.workouts.rejected, 1);
        assert_eq!(report.workouts.uploaded, 1);

        let rows = remote_rows(&remote, Collection::WorkoutCompletions).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["workout_date"], "2024-01-01");

        let service = TrackingService::new(&cache).with_today(today());
        assert!(service.is_workout_completed(&u1(), date(2024, 1, 3), None).await);
        assert_eq!(load_records::<WorkoutCompletion>(&cache).len(), 2);
    }

    #[tokio::test]
    async fn test_older_local_record_loses_to_remote() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        remote
            .insert(
                Collection::MealCompletions,
                &[serde_json::to_value(meal("remote-1", u1(), "2024-01-01", "lunch", "2024-01-01T12:00:00Z")).unwrap()],
            )
            .await
            .unwrap();
        store_records(
            &cache,
            &[meal("local-1", u1(), "2024-01-01", "Lunch", "2024-01-01T11:59:59Z")],
        )
        .unwrap();

        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert_eq!(report.meals.fetched, 1);
        assert_eq!(report.meals.uploaded, 0);

        let stored = load_records::<MealCompletion>(&cache);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "remote-1");
        assert_eq!(stored[0].completed_at, "2024-01-01T12:00:00Z");
    }

    #[tokio::test]
    async fn test_newer_local_record_is_uploaded_under_remote_id() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        remote
            .insert(
                Collection::MealCompletions,
                &[serde_json::to_value(meal("remote-1", u1(), "2024-01-01", "lunch", "2024-01-01T12:00:00Z")).unwrap()],
            )
            .await
            .unwrap();
        store_records(
            &cache,
            &[meal("local-1", u1(), "2024-01-01", "lunch", "2024-01-01T12:30:00Z")],
        )
        .unwrap();

        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert_eq!(report.meals.uploaded, 1);

        let rows = remote_rows(&remote, Collection::MealCompletions).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "remote-1");
        assert_eq!(rows[0]["completed_at"], "2024-01-01T12:30:00Z");

        let stored = load_records::<MealCompletion>(&cache);
        assert_eq!(stored[0].id, "remote-1");
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        remote
            .insert(
                Collection::WorkoutCompletions,
                &[serde_json::to_value(workout("r1", u1(), "2023-12-30", "Saturday", "2023-12-30T08:00:00Z")).unwrap()],
            )
            .await
            .unwrap();
        store_records(
            &cache,
            &[
                workout("l1", Identity::Local, "2024-01-01", "Monday", "2024-01-01T08:00:00Z"),
                workout("l2", Identity::Local, "2024-01-05", "Friday", "2024-01-01T09:00:00Z"),
            ],
        )
        .unwrap();
        let reconciler = Reconciler::new(&cache, &remote);

        let first = reconciler.reconcile_on(&u1(), today()).await.unwrap();
        let after_first = load_records::<WorkoutCompletion>(&cache);
        let second = reconciler.reconcile_on(&u1(), today()).await.unwrap();
        let after_second = load_records::<WorkoutCompletion>(&cache);

        assert_eq!(first.workouts.rewritten, 1);
        assert_eq!(first.workouts.uploaded, 1);
        assert_eq!(second.workouts.rewritten, 0);
        assert_eq!(second.workouts.uploaded, 0);
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.len(), 3);
        assert_eq!(remote_rows(&remote, Collection::WorkoutCompletions).await.len(), 2);
    }

    #[tokio::test]
    async fn test_other_accounts_are_untouched() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        let u2_meal = meal("u2", Identity::authenticated("U2"), "2024-01-01", "dinner", "2024-01-01T19:00:00Z");
        store_records(&cache, &[u2_meal.clone()]).unwrap();

        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert_eq!(report.meals.uploaded, 0);
        assert_eq!(load_records::<MealCompletion>(&cache), vec![u2_meal]);
        assert!(remote_rows(&remote, Collection::MealCompletions).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_only_fails_that_kind() {
        let cache = new_cache();
        let remote = ScriptedRemote {
            fail_select: Some(Collection::MealCompletions),
            ..ScriptedRemote::healthy()
        };
        store_records(
            &cache,
            &[meal("m1", Identity::Local, "2024-01-01", "lunch", "2024-01-01T12:00:00Z")],
        )
        .unwrap();
        store_records(
            &cache,
            &[workout("w1", Identity::Local, "2024-01-01", "Monday", "2024-01-01T08:00:00Z")],
        )
        .unwrap();

        let reconciler = Reconciler::new(&cache, &remote);
        let report = reconciler.reconcile_on(&u1(), today()).await.unwrap();

        assert!(!report.succeeded());
        assert!(report.workouts.succeeded());
        assert!(matches!(report.meals.state, SyncState::Failed(ref reason) if reason.contains("network unreachable")));
        assert_eq!(reconciler.state(), SyncState::Idle);

        // Meals were not rewritten; workouts were
        assert_eq!(load_records::<MealCompletion>(&cache)[0].user_id, Identity::Local);
        assert_eq!(load_records::<WorkoutCompletion>(&cache)[0].user_id, u1());
    }

    #[tokio::test]
    async fn test_upload_failure_skips_writeback() {
        let cache = new_cache();
        let remote = ScriptedRemote {
            fail_upsert: Some(Collection::WorkoutCompletions),
            ..ScriptedRemote::healthy()
        };
        store_records(
            &cache,
            &[workout("w1", Identity::Local, "2024-01-01", "Monday", "2024-01-01T08:00:00Z")],
        )
        .unwrap();

        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert!(!report.workouts.succeeded());
        assert_eq!(load_records::<WorkoutCompletion>(&cache)[0].user_id, Identity::Local);
    }

    #[tokio::test]
    async fn test_reconcile_requires_account() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        let result = Reconciler::new(&cache, &remote)
            .reconcile_on(&Identity::Local, today())
            .await;
        assert!(result.is_err());
    }

    /// Hosted store that records a workout on this device while an upload is
    /// in flight, the way a `workout done` racing a sync would.
    struct MarksDuringUpload<'a> {
        inner: HostedStore,
        cache: &'a LocalCache,
        marked: WorkoutCompletion,
    }

    #[async_trait]
    impl RemoteStore for MarksDuringUpload<'_> {
        async fn select(&self, collection: Collection, query: &Query) -> Result<Vec<Value>> {
            self.inner.select(collection, query).await
        }

        async fn insert(&self, collection: Collection, rows: &[Value]) -> Result<()> {
            self.inner.insert(collection, rows).await
        }

        async fn update(&self, collection: Collection, filters: &[Filter], patch: &Value) -> Result<u64> {
            self.inner.update(collection, filters, patch).await
        }

        async fn upsert(&self, collection: Collection, rows: &[Value], keys: &[&str]) -> Result<()> {
            if collection == Collection::WorkoutCompletions {
                let mut records = load_records::<WorkoutCompletion>(self.cache);
                records.push(self.marked.clone());
                store_records(self.cache, &records)?;
            }
            self.inner.upsert(collection, rows, keys).await
        }

        async fn delete(&self, collection: Collection, filters: &[Filter]) -> Result<u64> {
            self.inner.delete(collection, filters).await
        }
    }

    #[tokio::test]
    async fn test_writeback_keeps_records_marked_during_upload() {
        let cache = new_cache();
        store_records(
            &cache,
            &[workout("w1", Identity::Local, "2024-01-01", "Monday", "2024-01-01T08:00:00Z")],
        )
        .unwrap();
        let remote = MarksDuringUpload {
            inner: HostedStore::open_in_memory().unwrap(),
            cache: &cache,
            marked: workout("w2", u1(), "2024-01-02", "Tuesday", "2024-01-02T07:00:00Z"),
        };

        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert!(report.workouts.succeeded());
        assert_eq!(report.workouts.uploaded, 1);

        let stored = load_records::<WorkoutCompletion>(&cache);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, "w2");
        assert_eq!(stored[1].id, "w1");
        assert!(stored.iter().all(|r| r.user_id == u1()));

        let service = TrackingService::new(&cache).with_today(today());
        assert!(service.is_workout_completed(&u1(), date(2024, 1, 2), None).await);
        assert!(service.is_workout_completed(&u1(), date(2024, 1, 1), None).await);

        // The next run uploads the record it missed
        let again = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert_eq!(again.workouts.uploaded, 1);
        assert_eq!(remote_rows(&remote, Collection::WorkoutCompletions).await.len(), 2);
    }

    #[tokio::test]
    async fn test_window_edge_is_uploaded_and_day_past_it_held_back() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        // 366 and 365 days before 2024-01-02
        store_records(
            &cache,
            &[
                meal("old", Identity::Local, "2023-01-01", "lunch", "2023-01-01T12:00:00Z"),
                meal("edge", Identity::Local, "2023-01-02", "lunch", "2023-01-02T12:00:00Z"),
            ],
        )
        .unwrap();

        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert_eq!(report.meals.rejected, 1);
        assert_eq!(report.meals.uploaded, 1);

        let rows = remote_rows(&remote, Collection::MealCompletions).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["meal_date"], "2023-01-02");

        let stored = load_records::<MealCompletion>(&cache);
        assert_eq!(stored.len(), 2);
        let old = stored.iter().find(|r| r.id == "old").unwrap();
        assert_eq!(old.user_id, Identity::Local);
    }

    #[tokio::test]
    async fn test_placeholder_record_losing_its_slot_is_not_counted_as_claimed() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        remote
            .insert(
                Collection::MealCompletions,
                &[serde_json::to_value(meal("remote-1", u1(), "2024-01-01", "dinner", "2024-01-01T19:00:00Z")).unwrap()],
            )
            .await
            .unwrap();
        store_records(
            &cache,
            &[meal("local-1", Identity::Local, "2024-01-01", "dinner", "2024-01-01T18:00:00Z")],
        )
        .unwrap();

        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert_eq!(report.meals.rewritten, 0);
        assert_eq!(report.meals.uploaded, 0);

        let stored = load_records::<MealCompletion>(&cache);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "remote-1");
    }

    #[tokio::test]
    async fn test_timestamp_shaped_date_merges_with_plain_date() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        remote
            .insert(
                Collection::WorkoutCompletions,
                &[serde_json::to_value(workout("remote-1", u1(), "2024-01-01", "Monday", "2024-01-01T08:00:00Z")).unwrap()],
            )
            .await
            .unwrap();
        store_records(
            &cache,
            &[workout("local-1", u1(), "2024-01-01T07:30:00Z", "Monday", "2024-01-01T09:00:00Z")],
        )
        .unwrap();

        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert_eq!(report.workouts.merged, 1);
        assert_eq!(report.workouts.uploaded, 1);

        let rows = remote_rows(&remote, Collection::WorkoutCompletions).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "remote-1");
        assert_eq!(rows[0]["completed_at"], "2024-01-01T09:00:00Z");

        let stored = load_records::<WorkoutCompletion>(&cache);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "remote-1");
    }

    fn plan(id: &str, updated_at: &str) -> PlanPayload {
        PlanPayload {
            plan_id: id.to_string(),
            updated_at: updated_at.to_string(),
            content: json!({"days": 3}),
        }
    }

    #[test]
    fn test_merge_profiles_by_recency_with_plan_overrides() {
        let local = ProfileFragment {
            updated_at: "2024-01-02T00:00:00Z".to_string(),
            weight_kg: Some(72.0),
            workout_plan: Some(plan("local-plan", "2024-01-01T00:00:00Z")),
            meal_plan: Some(plan("local-meals", "2024-01-03T00:00:00Z")),
            ..ProfileFragment::default()
        };
        let remote = ProfileFragment {
            updated_at: "2024-01-01T00:00:00Z".to_string(),
            weight_kg: Some(75.0),
            workout_plan: Some(plan("remote-plan", "2024-01-05T00:00:00Z")),
            meal_plan: None,
            ..ProfileFragment::default()
        };

        let merged = merge_profiles(&local, &remote);
        assert_eq!(merged.weight_kg, Some(72.0));
        assert_eq!(merged.workout_plan.unwrap().plan_id, "remote-plan");
        assert_eq!(merged.meal_plan.unwrap().plan_id, "local-meals");
    }

    #[test]
    fn test_merge_profiles_tie_goes_to_remote() {
        let local = ProfileFragment {
            updated_at: "2024-01-01T00:00:00Z".to_string(),
            weight_kg: Some(60.0),
            ..ProfileFragment::default()
        };
        let remote = ProfileFragment {
            weight_kg: Some(61.0),
            ..local.clone()
        };
        assert_eq!(merge_profiles(&local, &remote).weight_kg, Some(61.0));
    }

    #[tokio::test]
    async fn test_profile_reconcile_uploads_and_caches_per_account() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        cache
            .set(
                PROFILE_KEY,
                &ProfileFragment {
                    updated_at: "2024-01-01T00:00:00Z".to_string(),
                    weight_kg: Some(68.0),
                    ..ProfileFragment::default()
                },
            )
            .unwrap();

        let reconciler = Reconciler::new(&cache, &remote);
        let report = reconciler.reconcile_on(&u1(), today()).await.unwrap();
        assert_eq!(report.profile.rewritten, 1);
        assert_eq!(report.profile.uploaded, 1);

        let cached: ProfileFragment = cache.get_or_default(&account_profile_key("U1"));
        assert_eq!(cached.user_id, u1());
        assert_eq!(cached.weight_kg, Some(68.0));

        let rows = remote_rows(&remote, Collection::UserProfiles).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["user_id"], "U1");

        let again = reconciler.reconcile_on(&u1(), today()).await.unwrap();
        assert_eq!(again.profile.uploaded, 0);
        assert_eq!(again.profile.rewritten, 0);
    }

    #[tokio::test]
    async fn test_profile_with_nothing_on_either_side() {
        let cache = new_cache();
        let remote = ScriptedRemote::healthy();
        let report = Reconciler::new(&cache, &remote)
            .reconcile_on(&u1(), today())
            .await
            .unwrap();
        assert!(report.profile.succeeded());
        assert_eq!(report.profile.merged, 0);
        assert!(!cache.has(&account_profile_key("U1")));
    }
}
