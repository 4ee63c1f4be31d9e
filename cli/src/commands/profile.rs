use anyhow::{Result, bail};

use fitlog_core::models::{Gender, Identity};
use fitlog_core::service::{DEFAULT_WEIGHT_KG, TrackingService};

pub(crate) fn cmd_profile_show(
    service: &TrackingService<'_>,
    user: &Identity,
    json: bool,
) -> Result<()> {
    let profile = service.profile(user);

    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
        return Ok(());
    }

    println!("Profile for {user}");
    match profile.weight_kg {
        Some(kg) => println!("  Weight:  {kg:.1} kg"),
        None => println!("  Weight:  not set (estimates use {DEFAULT_WEIGHT_KG:.0} kg)"),
    }
    let gender = match profile.gender {
        Some(Gender::Male) => "male",
        Some(Gender::Female) => "female",
        Some(Gender::Other) => "other",
        None => "not set",
    };
    println!("  Gender:  {gender}");
    match profile.age {
        Some(age) => println!("  Age:     {age}"),
        None => println!("  Age:     not set"),
    }
    if let Some(ref goal) = profile.fitness_goal {
        println!("  Goal:    {goal}");
    }
    if let Some(ref plan) = profile.workout_plan {
        println!("  Workout plan: {}", plan.plan_id);
    }
    if let Some(ref plan) = profile.meal_plan {
        println!("  Meal plan:    {}", plan.plan_id);
    }
    if !profile.updated_at.is_empty() {
        println!("  Updated: {}", profile.updated_at);
    }

    Ok(())
}

pub(crate) fn cmd_profile_set(
    service: &TrackingService<'_>,
    user: &Identity,
    weight: Option<f64>,
    gender: Option<String>,
    age: Option<u32>,
    goal: Option<String>,
    json: bool,
) -> Result<()> {
    if weight.is_none() && gender.is_none() && age.is_none() && goal.is_none() {
        bail!("Nothing to update. Pass --weight, --gender, --age or --goal");
    }

    let mut profile = service.profile(user);
    if let Some(kg) = weight {
        if kg <= 0.0 || kg > 500.0 {
            bail!("Weight must be between 0 and 500 kg");
        }
        profile.weight_kg = Some(kg);
    }
    if let Some(ref g) = gender {
        let Some(parsed) = Gender::parse(g) else {
            bail!("Invalid gender '{g}'. Use male, female or other");
        };
        profile.gender = Some(parsed);
    }
    if let Some(age) = age {
        if age == 0 || age > 120 {
            bail!("Age must be between 1 and 120");
        }
        profile.age = Some(age);
    }
    if let Some(goal) = goal {
        let goal = goal.trim().to_string();
        profile.fitness_goal = if goal.is_empty() { None } else { Some(goal) };
    }

    let saved = service.save_profile(user, profile)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
    } else {
        println!("Profile updated");
        if user.is_authenticated() && service.has_remote() {
            eprintln!("Run `fitlog sync` to upload it.");
        }
    }

    Ok(())
}
