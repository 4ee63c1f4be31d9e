mod account;
mod helpers;
mod meal;
mod profile;
mod stats;
mod workout;

pub(crate) use account::{cmd_login, cmd_logout, cmd_reset, cmd_sync};
pub(crate) use meal::{cmd_meal_check, cmd_meal_done, cmd_meal_list};
pub(crate) use profile::{cmd_profile_set, cmd_profile_show};
pub(crate) use stats::{cmd_stats_meals, cmd_stats_workouts};
pub(crate) use workout::{cmd_workout_check, cmd_workout_done, cmd_workout_list};
