use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::Serialize;

use fitlog_core::service::RemoteWrite;

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

/// Tell the user when a record was kept locally but the remote did not
/// take it. The next sync retries.
pub(crate) fn report_remote_write(remote: &RemoteWrite) {
    if let RemoteWrite::Failed(reason) = remote {
        eprintln!("Note: saved locally; could not confirm with remote ({reason})");
    }
}

pub(crate) fn format_percent(rate: f64) -> String {
    format!("{:.0}%", no_neg_zero(rate * 100.0))
}

/// Local wall-clock rendering of an RFC 3339 timestamp; unparsable values
/// are shown as-is.
pub(crate) fn format_timestamp(value: &str) -> String {
    fitlog_core::models::parse_timestamp(value).map_or_else(
        || value.to_string(),
        |ts| {
            ts.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        },
    )
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
