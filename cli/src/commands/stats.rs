use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use fitlog_core::models::{DayBucket, Identity, StatsWindow};
use fitlog_core::service::TrackingService;

use super::helpers::format_percent;

#[derive(Tabled)]
struct DayRow {
    #[tabled(rename = "Day")]
    label: String,
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Done")]
    count: u32,
}

fn print_days(days: &[DayBucket]) {
    let rows: Vec<DayRow> = days
        .iter()
        .map(|d| DayRow {
            label: d.label.clone(),
            date: d.date.clone(),
            count: d.count,
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

fn window_for(service: &TrackingService<'_>, days: u32) -> Result<StatsWindow> {
    if days == 0 || days > 366 {
        bail!("Days must be between 1 and 366");
    }
    Ok(StatsWindow::last_days(days, service.today()))
}

pub(crate) fn cmd_stats_workouts(
    service: &TrackingService<'_>,
    user: &Identity,
    days: u32,
    per_week: u32,
    json: bool,
) -> Result<()> {
    if per_week == 0 || per_week > 7 {
        bail!("Workouts per week must be between 1 and 7");
    }
    let window = window_for(service, days)?;
    let stats = service.get_workout_stats(user, window, per_week);

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Workouts {} to {}", stats.window.start, stats.window.end);
    println!(
        "  Completed:  {} of {} expected ({})",
        stats.total_workouts,
        stats.expected_workouts,
        format_percent(stats.completion_rate)
    );
    println!(
        "  Streak:     {} day(s), longest {}",
        stats.current_streak, stats.longest_streak
    );
    println!("  Burned:     ~{:.0} kcal", stats.total_calories_burned);
    if let Some(ref last) = stats.last_completed {
        println!("  Last:       {last}");
    }
    if days <= 31 {
        println!();
        print_days(&stats.days);
    }

    Ok(())
}

pub(crate) fn cmd_stats_meals(
    service: &TrackingService<'_>,
    user: &Identity,
    days: u32,
    json: bool,
) -> Result<()> {
    let window = window_for(service, days)?;
    let stats = service.get_meal_stats(user, window);

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Meals {} to {}", stats.window.start, stats.window.end);
    println!(
        "  Completed:  {} of {} expected ({})",
        stats.total_meals,
        stats.expected_meals,
        format_percent(stats.completion_rate)
    );
    println!(
        "  Streak:     {} day(s), longest {}",
        stats.current_streak, stats.longest_streak
    );
    let by_type = stats
        .by_type
        .iter()
        .map(|(meal_type, count)| format!("{meal_type} {count}"))
        .collect::<Vec<_>>()
        .join(", ");
    println!("  By meal:    {by_type}");
    if let Some(ref last) = stats.last_completed {
        println!("  Last:       {last}");
    }
    if days <= 31 {
        println!();
        print_days(&stats.days);
    }

    Ok(())
}
