use anyhow::{Result, bail};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use fitlog_core::cache::LocalCache;
use fitlog_core::models::{Identity, LOCAL_USER_ID};
use fitlog_core::remote::RemoteStore;
use fitlog_core::service::TrackingService;
use fitlog_core::sync::{KindReport, Reconciler, SyncReport};

fn print_report(report: &SyncReport) {
    #[derive(Tabled)]
    struct KindRow {
        #[tabled(rename = "Kind")]
        kind: &'static str,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "Fetched")]
        fetched: usize,
        #[tabled(rename = "Merged")]
        merged: usize,
        #[tabled(rename = "Uploaded")]
        uploaded: usize,
        #[tabled(rename = "Held back")]
        rejected: usize,
    }

    let row = |kind, r: &KindReport| KindRow {
        kind,
        state: r.state.to_string(),
        fetched: r.fetched,
        merged: r.merged,
        uploaded: r.uploaded,
        rejected: r.rejected,
    };
    let rows = vec![
        row("workouts", &report.workouts),
        row("meals", &report.meals),
        row("profile", &report.profile),
    ];

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    let rewritten =
        report.workouts.rewritten + report.meals.rewritten + report.profile.rewritten;
    if rewritten > 0 {
        println!("Claimed {rewritten} local record(s) for {}", report.account);
    }
}

async fn reconcile(
    cache: &LocalCache,
    remote: &dyn RemoteStore,
    user: &Identity,
    json: bool,
) -> Result<SyncReport> {
    let report = Reconciler::new(cache, remote).reconcile(user).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report)
}

pub(crate) async fn cmd_login(
    cache: &LocalCache,
    service: &TrackingService<'_>,
    remote: Option<&dyn RemoteStore>,
    account: &str,
    json: bool,
) -> Result<()> {
    let account = account.trim();
    if account.is_empty() || account == LOCAL_USER_ID {
        bail!("Invalid account id '{account}'");
    }

    let identity = Identity::authenticated(account);
    service.set_session(&identity)?;

    let Some(remote) = remote else {
        if json {
            #[derive(Serialize)]
            struct LoginResult<'a> {
                account: &'a str,
                synced: bool,
            }
            let result = LoginResult {
                account,
                synced: false,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("Signed in as {account}");
            eprintln!("No remote configured; local records are claimed on the next `fitlog sync`.");
        }
        return Ok(());
    };

    if !json {
        println!("Signed in as {account}");
    }
    let report = reconcile(cache, remote, &identity, json).await?;
    if !report.succeeded() {
        eprintln!("Note: sync did not finish; local records are kept. Run `fitlog sync` to retry.");
    }

    Ok(())
}

pub(crate) fn cmd_logout(service: &TrackingService<'_>, json: bool) -> Result<()> {
    let previous = service.session();
    service.set_session(&Identity::Local)?;

    if json {
        #[derive(Serialize)]
        struct LogoutResult {
            previous: Identity,
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&LogoutResult { previous })?
        );
    } else if previous.is_authenticated() {
        println!("Signed out of {previous}");
    } else {
        println!("Not signed in");
    }

    Ok(())
}

pub(crate) async fn cmd_sync(
    cache: &LocalCache,
    service: &TrackingService<'_>,
    remote: Option<&dyn RemoteStore>,
    json: bool,
) -> Result<()> {
    let Some(remote) = remote else {
        bail!("No remote configured. Pass --remote or set FITLOG_REMOTE_URL");
    };
    let user = service.session();
    if !user.is_authenticated() {
        bail!("Not signed in. Run `fitlog login <account>` first");
    }

    let report = reconcile(cache, remote, &user, json).await?;
    if !report.succeeded() {
        bail!("Sync did not finish; local records are kept");
    }
    Ok(())
}

pub(crate) async fn cmd_reset(
    service: &TrackingService<'_>,
    user: &Identity,
    yes: bool,
    json: bool,
) -> Result<()> {
    if !yes {
        bail!("This deletes every completion for {user}. Re-run with --yes to confirm");
    }

    let removed = service.clear_completions(user).await?;

    if json {
        #[derive(Serialize)]
        struct ResetResult {
            removed: usize,
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&ResetResult { removed })?
        );
    } else {
        println!("Removed {removed} local completion(s)");
    }

    Ok(())
}
