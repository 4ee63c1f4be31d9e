use std::process;

use anyhow::Result;
use serde::Serialize;
use tabled::{Table, Tabled, settings::Style};

use fitlog_core::models::{Identity, validate_meal_type};
use fitlog_core::service::TrackingService;

use super::helpers::{format_timestamp, json_error, parse_date, report_remote_write, truncate};

pub(crate) async fn cmd_meal_done(
    service: &TrackingService<'_>,
    user: &Identity,
    meal_type: &str,
    date: Option<String>,
    plan: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    let marked = service
        .mark_meal_complete(user, date, meal_type, plan.as_deref())
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&marked)?);
    } else {
        println!(
            "Completed {} for {}",
            marked.record.meal_type, marked.record.meal_date
        );
        report_remote_write(&marked.remote);
    }

    Ok(())
}

pub(crate) async fn cmd_meal_check(
    service: &TrackingService<'_>,
    user: &Identity,
    meal_type: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    #[derive(Serialize)]
    struct CheckResult {
        date: String,
        meal_type: String,
        completed: bool,
    }

    let meal_type = validate_meal_type(meal_type)?;
    let date = parse_date(date)?;
    let completed = service
        .is_meal_completed(user, date, meal_type.as_str())
        .await;

    if json {
        let result = CheckResult {
            date: date.to_string(),
            meal_type: meal_type.to_string(),
            completed,
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if completed {
        println!("{meal_type} completed on {date}");
    } else {
        println!("{meal_type} not completed on {date}");
    }

    if !completed {
        process::exit(2);
    }
    Ok(())
}

pub(crate) fn cmd_meal_list(
    service: &TrackingService<'_>,
    user: &Identity,
    limit: usize,
    json: bool,
) -> Result<()> {
    let mut records = service.meal_completions(user);
    records.truncate(limit);

    if records.is_empty() {
        if json {
            println!("{}", json_error("No meals recorded"));
        } else {
            eprintln!("No meals recorded.");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    #[derive(Tabled)]
    struct MealRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Plan")]
        plan: String,
        #[tabled(rename = "Completed")]
        completed_at: String,
    }

    let rows: Vec<MealRow> = records
        .iter()
        .map(|r| MealRow {
            date: r.meal_date.clone(),
            meal: r.meal_type.clone(),
            plan: r
                .meal_plan_id
                .as_deref()
                .map(|p| truncate(p, 20))
                .unwrap_or_default(),
            completed_at: format_timestamp(&r.completed_at),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");

    Ok(())
}
