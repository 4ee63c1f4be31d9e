mod commands;
mod config;
mod remote_client;
mod server;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::process;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    cmd_login, cmd_logout, cmd_meal_check, cmd_meal_done, cmd_meal_list, cmd_profile_set,
    cmd_profile_show, cmd_reset, cmd_stats_meals, cmd_stats_workouts, cmd_sync,
    cmd_workout_check, cmd_workout_done, cmd_workout_list,
};
use crate::config::Config;
use crate::remote_client::HttpRemote;
use fitlog_core::cache::LocalCache;
use fitlog_core::db::Database;
use fitlog_core::remote::{HostedStore, RemoteStore};
use fitlog_core::service::TrackingService;

#[derive(Parser)]
#[command(
    name = "fitlog",
    version,
    about = "Offline-first workout and meal completion tracker",
    long_about = "Offline-first workout and meal completion tracker.\n\n\
        Completions are recorded on this device first and mirrored to a remote \
        store when one is configured and you are signed in."
)]
struct Cli {
    /// Base URL of the remote store (e.g. http://127.0.0.1:8080)
    #[arg(long, global = true, env = "FITLOG_REMOTE_URL")]
    remote: Option<String>,
    /// API key for the remote store
    #[arg(long, global = true, env = "FITLOG_REMOTE_KEY", hide_env_values = true)]
    remote_key: Option<String>,
    /// Cap on local storage in bytes
    #[arg(long, global = true, env = "FITLOG_QUOTA_BYTES")]
    quota_bytes: Option<u64>,
    /// Log more (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record and query workout completions
    Workout {
        #[command(subcommand)]
        command: WorkoutCommands,
    },
    /// Record and query meal completions
    Meal {
        #[command(subcommand)]
        command: MealCommands,
    },
    /// Streaks and completion rates
    Stats {
        #[command(subcommand)]
        command: StatsCommands,
    },
    /// Body metrics used for calorie estimates
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Sign in and reconcile local records with the remote store
    Login {
        /// Account id
        account: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign out (records made afterwards stay on this device)
    Logout {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reconcile local records with the remote store
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every completion for the current identity
    Reset {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Host a remote store over HTTP
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum WorkoutCommands {
    /// Mark a workout complete
    Done {
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Plan day number, 1 = Monday (default: the date's weekday)
        #[arg(long)]
        day: Option<i64>,
        /// Workout plan id
        #[arg(long)]
        plan: Option<String>,
        /// Activity type (e.g. running, strength, yoga)
        #[arg(short, long)]
        activity: Option<String>,
        /// Duration in minutes (default: 45)
        #[arg(short, long)]
        minutes: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether a workout was completed (exit 2 if not)
    Check {
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Day name to match (e.g. Monday)
        #[arg(long)]
        day: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recorded workouts, newest first
    List {
        /// Maximum number of rows
        #[arg(short, long, default_value = "30")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MealCommands {
    /// Mark a meal complete
    Done {
        /// Meal type: breakfast, lunch, dinner, snack
        meal_type: String,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Meal plan id
        #[arg(long)]
        plan: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether a meal was completed (exit 2 if not)
    Check {
        /// Meal type: breakfast, lunch, dinner, snack
        meal_type: String,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recorded meals, newest first
    List {
        /// Maximum number of rows
        #[arg(short, long, default_value = "30")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum StatsCommands {
    /// Workout totals, streaks and completion rate
    Workouts {
        /// Number of days ending today
        #[arg(short, long, default_value = "7")]
        days: u32,
        /// Planned workouts per week
        #[arg(long, default_value = "3")]
        per_week: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Meal totals, streaks and completion rate
    Meals {
        /// Number of days ending today
        #[arg(short, long, default_value = "7")]
        days: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show the current profile
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Update body metrics or goal
    Set {
        /// Body weight in kg
        #[arg(long)]
        weight: Option<f64>,
        /// Gender: male, female, other
        #[arg(long)]
        gender: Option<String>,
        /// Age in years
        #[arg(long)]
        age: Option<u32>,
        /// Fitness goal (free text; empty to clear)
        #[arg(long)]
        goal: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let Cli {
        remote,
        remote_key,
        quota_bytes,
        command,
        ..
    } = cli;

    match command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let (api_key, new_api_key) = if no_auth {
                (None, false)
            } else {
                let (key, new) = config.load_or_create_api_key()?;
                (Some(key), new)
            };
            let store = HostedStore::new(Database::open(&config.remote_db_path)?);
            server::start_server(store, port, &bind, api_key, new_api_key).await
        }
        command => run_tracking(&config, command, remote, remote_key, quota_bytes).await,
    }
}

#[allow(clippy::too_many_lines)]
async fn run_tracking(
    config: &Config,
    command: Commands,
    remote_url: Option<String>,
    remote_key: Option<String>,
    quota_bytes: Option<u64>,
) -> Result<()> {
    let db = Database::open(&config.local_db_path)?.with_quota(quota_bytes);
    let cache = LocalCache::new(db);
    let loaded = cache.init();
    debug!(loaded, path = %config.local_db_path.display(), "local cache ready");

    let http = match remote_url {
        Some(ref url) => Some(HttpRemote::new(url, remote_key)?),
        None => None,
    };
    let remote: Option<&dyn RemoteStore> = http.as_ref().map(|r| r as &dyn RemoteStore);

    let mut service = TrackingService::new(&cache);
    if let Some(remote) = remote {
        service = service.with_remote(remote);
    }
    let user = service.session();

    match command {
        Commands::Workout { command } => match command {
            WorkoutCommands::Done {
                date,
                day,
                plan,
                activity,
                minutes,
                json,
            } => cmd_workout_done(&service, &user, date, day, plan, activity, minutes, json).await,
            WorkoutCommands::Check { date, day, json } => {
                cmd_workout_check(&service, &user, date, day, json).await
            }
            WorkoutCommands::List { limit, json } => cmd_workout_list(&service, &user, limit, json),
        },
        Commands::Meal { command } => match command {
            MealCommands::Done {
                meal_type,
                date,
                plan,
                json,
            } => cmd_meal_done(&service, &user, &meal_type, date, plan, json).await,
            MealCommands::Check {
                meal_type,
                date,
                json,
            } => cmd_meal_check(&service, &user, &meal_type, date, json).await,
            MealCommands::List { limit, json } => cmd_meal_list(&service, &user, limit, json),
        },
        Commands::Stats { command } => match command {
            StatsCommands::Workouts {
                days,
                per_week,
                json,
            } => cmd_stats_workouts(&service, &user, days, per_week, json),
            StatsCommands::Meals { days, json } => cmd_stats_meals(&service, &user, days, json),
        },
        Commands::Profile { command } => match command {
            ProfileCommands::Show { json } => cmd_profile_show(&service, &user, json),
            ProfileCommands::Set {
                weight,
                gender,
                age,
                goal,
                json,
            } => cmd_profile_set(&service, &user, weight, gender, age, goal, json),
        },
        Commands::Login { account, json } => {
            cmd_login(&cache, &service, remote, &account, json).await
        }
        Commands::Logout { json } => cmd_logout(&service, json),
        Commands::Sync { json } => cmd_sync(&cache, &service, remote, json).await,
        Commands::Reset { yes, json } => cmd_reset(&service, &user, yes, json).await,
        Commands::Serve { .. } => bail!("`serve` does not use the local cache"),
    }
}
