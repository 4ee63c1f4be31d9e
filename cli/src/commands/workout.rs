use std::process;

use anyhow::{Result, bail};
use chrono::Datelike;
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use fitlog_core::models::{Identity, WorkoutDetails, canonical_day_name};
use fitlog_core::service::TrackingService;

use super::helpers::{format_timestamp, json_error, parse_date, report_remote_write, truncate};

#[allow(clippy::too_many_arguments)]
pub(crate) async fn cmd_workout_done(
    service: &TrackingService<'_>,
    user: &Identity,
    date: Option<String>,
    day: Option<i64>,
    plan: Option<String>,
    activity: Option<String>,
    minutes: Option<f64>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    let day_number = day.unwrap_or_else(|| i64::from(date.weekday().number_from_monday()));

    let mut details = WorkoutDetails::default();
    if let Some(activity) = activity {
        details.activity_type = activity.trim().to_lowercase();
    }
    if let Some(minutes) = minutes {
        if minutes <= 0.0 {
            bail!("Duration must be greater than 0 minutes");
        }
        details.duration_minutes = minutes;
    }

    let marked = service
        .mark_workout_complete(user, date, day_number, plan.as_deref(), &details)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&marked)?);
    } else {
        let record = &marked.record;
        println!(
            "Completed {} workout for {} (~{:.0} kcal)",
            record.workout_day_name, record.workout_date, record.estimated_calories_burned
        );
        report_remote_write(&marked.remote);
    }

    Ok(())
}

pub(crate) async fn cmd_workout_check(
    service: &TrackingService<'_>,
    user: &Identity,
    date: Option<String>,
    day: Option<String>,
    json: bool,
) -> Result<()> {
    #[derive(Serialize)]
    struct CheckResult {
        date: String,
        day: Option<String>,
        completed: bool,
    }

    let date = parse_date(date)?;
    let day = day.map(|d| canonical_day_name(&d));
    let completed = service
        .is_workout_completed(user, date, day.as_deref())
        .await;

    if json {
        let result = CheckResult {
            date: date.to_string(),
            day: day.clone(),
            completed,
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let what = day.map_or_else(|| "Workout".to_string(), |d| format!("{d} workout"));
        if completed {
            println!("{what} completed on {date}");
        } else {
            println!("{what} not completed on {date}");
        }
    }

    if !completed {
        process::exit(2);
    }
    Ok(())
}

pub(crate) fn cmd_workout_list(
    service: &TrackingService<'_>,
    user: &Identity,
    limit: usize,
    json: bool,
) -> Result<()> {
    let mut records = service.workout_completions(user);
    records.truncate(limit);

    if records.is_empty() {
        if json {
            println!("{}", json_error("No workouts recorded"));
        } else {
            eprintln!("No workouts recorded.");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    #[derive(Tabled)]
    struct WorkoutRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Day")]
        day: String,
        #[tabled(rename = "Plan")]
        plan: String,
        #[tabled(rename = "Calories")]
        calories: String,
        #[tabled(rename = "Completed")]
        completed_at: String,
    }

    let rows: Vec<WorkoutRow> = records
        .iter()
        .map(|r| WorkoutRow {
            date: r.workout_date.clone(),
            day: r.workout_day_name.clone(),
            plan: r
                .workout_plan_id
                .as_deref()
                .map(|p| truncate(p, 20))
                .unwrap_or_default(),
            calories: format!("{:.0}", r.estimated_calories_burned),
            completed_at: format_timestamp(&r.completed_at),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}
