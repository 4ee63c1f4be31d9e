use chrono::{Duration, Local, NaiveDate};
use serde::Serialize;
use tracing::debug;

use crate::models::{Completion, MealCompletion, MealType, WorkoutCompletion, parse_record_date};

/// Oldest record (in days before today) accepted for upload.
pub const MAX_AGE_DAYS: i64 = 365;

/// Days a client's calendar may differ from the server's before the server
/// rejects a row as out of window.
pub const CLOCK_SKEW_DAYS: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub reasons: Vec<String>,
}

/// Per-kind structural checks.
pub trait RequiredFields {
    fn missing_fields(&self) -> Vec<String>;
}

impl RequiredFields for WorkoutCompletion {
    fn missing_fields(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if self.workout_date.trim().is_empty() {
            reasons.push("missing workout_date".to_string());
        }
        if self.workout_day_name.trim().is_empty() {
            reasons.push("missing workout_day_name".to_string());
        }
        reasons
    }
}

impl RequiredFields for MealCompletion {
    fn missing_fields(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if self.meal_date.trim().is_empty() {
            reasons.push("missing meal_date".to_string());
        }
        if self.meal_type.trim().is_empty() {
            reasons.push("missing meal_type".to_string());
        } else if MealType::parse(&self.meal_type).is_none() {
            reasons.push(format!("invalid meal_type '{}'", self.meal_type));
        }
        reasons
    }
}

/// True when `date` lies in `[today - MAX_AGE_DAYS, today]`.
#[must_use]
pub fn within_sync_window(date: NaiveDate, today: NaiveDate) -> bool {
    date <= today && date >= today - Duration::days(MAX_AGE_DAYS)
}

/// Classify a record for upload. Every rule is evaluated; the result lists
/// all failures.
pub fn is_valid_completion<C>(record: &C, today: NaiveDate) -> Validation
where
    C: Completion + RequiredFields,
{
    check_completion(record, today, 0)
}

fn check_completion<C>(record: &C, today: NaiveDate, slack_days: i64) -> Validation
where
    C: Completion + RequiredFields,
{
    let latest = today + Duration::days(slack_days);
    let oldest = today - Duration::days(MAX_AGE_DAYS + slack_days);
    let mut reasons = record.missing_fields();

    let raw_date = record.date_str().trim();
    if !raw_date.is_empty() {
        match parse_record_date(raw_date) {
            None => reasons.push(format!("unparsable date '{raw_date}'")),
            Some(date) if date > latest => {
                reasons.push(format!("date {date} is in the future"));
            }
            Some(date) if date < oldest => {
                reasons.push(format!("date {date} is more than {MAX_AGE_DAYS} days old"));
            }
            Some(_) => {}
        }
    }

    Validation {
        valid: reasons.is_empty(),
        reasons,
    }
}

/// Server-side check of an uploaded row against the server's local date.
/// Both ends of the window widen by [`CLOCK_SKEW_DAYS`], so a client whose
/// clock sits on the other side of midnight is not refused its own "today".
pub fn is_valid_upload<C>(record: &C, server_today: NaiveDate) -> Validation
where
    C: Completion + RequiredFields,
{
    check_completion(record, server_today, CLOCK_SKEW_DAYS)
}

/// [`is_valid_upload`] against the server's current local date.
pub fn is_valid_upload_today<C>(record: &C) -> Validation
where
    C: Completion + RequiredFields,
{
    is_valid_upload(record, Local::now().date_naive())
}

/// Keep only records that may be uploaded. Rejected records are logged and
/// otherwise left alone.
pub fn filter_valid<C>(records: &[C], today: NaiveDate) -> Vec<C>
where
    C: Completion + RequiredFields,
{
    records
        .iter()
        .filter(|record| {
            let check = is_valid_completion(*record, today);
            if !check.valid {
                debug!(
                    kind = C::KIND.label(),
                    id = record.id(),
                    reasons = ?check.reasons,
                    "record held back from upload"
                );
            }
            check.valid
        })
        .cloned()
        .collect()
}
