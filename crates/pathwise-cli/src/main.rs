//! Pathwise CLI - a terminal front-end for the pathwise learning platform.
//!
//! Every command starts the session the same way the web client does:
//! read the stored token, verify it with the backend, and only then decide
//! whether the user is signed in.

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pathwise_core::models::{
    Difficulty, LearningStyle, PasswordChange, ProfileUpdate, RegistrationForm,
    DEFAULT_DAILY_GOAL_MINUTES,
};
use pathwise_core::{AppContext, Config, Phase, Principal};

const USAGE: &str = "\
Usage: pathwise <command>

Commands:
  status            Show whether a session is active
  whoami            Print the signed-in user
  login [username]  Sign in (password is prompted)
  register          Create an account interactively
  logout            Sign out and forget the stored token
  profile [flags]   Show or update your profile
                      --first NAME  --last NAME  --goal MINUTES
                      --style visual|auditory|kinesthetic|reading
                      --difficulty beginner|intermediate|advanced
                      --reminders on|off  --email-notifications on|off
  passwd            Change your password
  delete-account    Delete your account and sign out

Environment:
  PATHWISE_API_URL  Backend base URL (default http://localhost:5000/api)
  RUST_LOG          Log filter, e.g. RUST_LOG=debug";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> Result<()> {
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command.as_str(), "help" | "--help" | "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load()?;
    let ctx = AppContext::start(config.clone()).await?;
    info!(command = %command, phase = ctx.session.phase().as_str(), "Session ready");

    match command.as_str() {
        "status" => {
            status(&ctx, &config);
            Ok(())
        }
        "whoami" => {
            let principal = require_principal(&ctx)?;
            println!("{}", principal.username);
            Ok(())
        }
        "login" => login(&ctx, &mut config, args.get(1).map(String::as_str)).await,
        "register" => register(&ctx, &mut config).await,
        "logout" => {
            ctx.session.logout();
            println!("Logged out.");
            Ok(())
        }
        "profile" => profile(&ctx, &args[1..]).await,
        "passwd" => passwd(&ctx).await,
        "delete-account" => delete_account(&ctx).await,
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn status(ctx: &AppContext, config: &Config) {
    let snapshot = ctx.session.snapshot();
    println!("Backend: {}", ctx.api.base_url());
    match (snapshot.phase, snapshot.principal) {
        (Phase::Authenticated, Some(principal)) => {
            println!("Signed in as {} ({})", principal.display_name(), principal.username);
            match config.token_stored_at() {
                Ok(Some(stored_at)) => {
                    println!("Token saved {}", stored_at.format("%Y-%m-%d %H:%M UTC"))
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to read stored token record"),
            }
        }
        (phase, _) => println!("Not signed in ({})", phase.as_str()),
    }
}

async fn login(ctx: &AppContext, config: &mut Config, username: Option<&str>) -> Result<()> {
    if let Some(principal) = ctx.session.principal() {
        println!("Already signed in as {}; signing in again.", principal.username);
    }

    let username = match username {
        Some(name) => name.to_string(),
        None => match config.last_username.clone() {
            Some(last) => prompt_default("Username", &last)?,
            None => prompt("Username")?,
        },
    };
    let password = rpassword::prompt_password("Password: ")?;

    ctx.session.login(&username, &password).await?;
    remember_username(config, &username);

    let principal = require_principal(ctx)?;
    println!("Welcome back, {}!", principal.display_name());
    Ok(())
}

async fn register(ctx: &AppContext, config: &mut Config) -> Result<()> {
    println!("\n=== Create a Pathwise account ===\n");

    let mut form = RegistrationForm {
        first_name: prompt("First name")?,
        last_name: prompt("Last name")?,
        username: prompt("Username")?,
        email: prompt("Email")?,
        ..RegistrationForm::default()
    };

    form.password = rpassword::prompt_password("Password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if form.password != confirm {
        bail!("Passwords do not match");
    }

    let style = prompt_default("Learning style", LearningStyle::default().as_str())?;
    form.learning_style = LearningStyle::parse(&style)
        .with_context(|| format!("Unknown learning style '{}'", style))?;

    let difficulty = prompt_default("Preferred difficulty", Difficulty::default().as_str())?;
    form.preferred_difficulty = Difficulty::parse(&difficulty)
        .with_context(|| format!("Unknown difficulty '{}'", difficulty))?;

    let goal = prompt_default("Daily goal (minutes)", &DEFAULT_DAILY_GOAL_MINUTES.to_string())?;
    form.daily_goal_minutes = goal
        .parse()
        .with_context(|| format!("'{}' is not a number of minutes", goal))?;

    ctx.session.register(&form).await?;
    remember_username(config, form.username.trim());

    println!("\nAccount created. You are signed in as {}.", form.username.trim());
    Ok(())
}

async fn profile(ctx: &AppContext, flags: &[String]) -> Result<()> {
    require_principal(ctx)?;

    let update = parse_profile_flags(flags)?;
    let principal = if update.is_empty() {
        ctx.session.refresh_principal().await?
    } else {
        let principal = ctx.session.update_profile(&update).await?;
        println!("Profile updated.\n");
        principal
    };

    print_principal(&principal);
    Ok(())
}

async fn passwd(ctx: &AppContext) -> Result<()> {
    require_principal(ctx)?;

    let change = PasswordChange {
        old_password: rpassword::prompt_password("Current password: ")?,
        new_password: rpassword::prompt_password("New password: ")?,
        confirm_new_password: rpassword::prompt_password("Confirm new password: ")?,
    };
    ctx.session.change_password(&change).await?;

    println!("Password updated.");
    Ok(())
}

async fn delete_account(ctx: &AppContext) -> Result<()> {
    let principal = require_principal(ctx)?;

    let answer = prompt(&format!(
        "Delete account '{}'? This cannot be undone. Type the username to confirm",
        principal.username
    ))?;
    if answer != principal.username {
        println!("Cancelled.");
        return Ok(());
    }

    ctx.session.delete_account().await?;
    println!("Account deleted.");
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn require_principal(ctx: &AppContext) -> Result<Principal> {
    ctx.session
        .principal()
        .context("Not signed in. Run `pathwise login` first.")
}

fn remember_username(config: &mut Config, username: &str) {
    config.last_username = Some(username.to_string());
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }
}

fn parse_profile_flags(flags: &[String]) -> Result<ProfileUpdate> {
    let mut update = ProfileUpdate::default();
    let mut iter = flags.iter();

    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .with_context(|| format!("Missing value for {}", flag))?;
        match flag.as_str() {
            "--first" => update.first_name = Some(value.clone()),
            "--last" => update.last_name = Some(value.clone()),
            "--goal" => {
                update.daily_goal_minutes = Some(
                    value
                        .parse()
                        .with_context(|| format!("'{}' is not a number of minutes", value))?,
                )
            }
            "--style" => {
                update.learning_style = Some(
                    LearningStyle::parse(value)
                        .with_context(|| format!("Unknown learning style '{}'", value))?,
                )
            }
            "--difficulty" => {
                update.preferred_difficulty = Some(
                    Difficulty::parse(value)
                        .with_context(|| format!("Unknown difficulty '{}'", value))?,
                )
            }
            "--reminders" => update.study_reminders_enabled = Some(parse_switch(value)?),
            "--email-notifications" => update.notification_email = Some(parse_switch(value)?),
            other => bail!("Unknown profile flag '{}'", other),
        }
    }

    Ok(update)
}

fn parse_switch(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "on" | "yes" | "true" => Ok(true),
        "off" | "no" | "false" => Ok(false),
        _ => bail!("Expected on or off, got '{}'", value),
    }
}

fn print_principal(principal: &Principal) {
    fn or_dash(value: Option<String>) -> String {
        value.unwrap_or_else(|| "-".to_string())
    }

    println!("Name:          {}", principal.display_name());
    println!("Username:      {}", principal.username);
    println!("Email:         {}", or_dash(principal.email.clone()));
    println!("Style:         {}", or_dash(principal.learning_style.map(|s| s.to_string())));
    println!("Difficulty:    {}", or_dash(principal.preferred_difficulty.map(|d| d.to_string())));
    println!("Daily goal:    {}", or_dash(principal.daily_goal_minutes.map(|m| format!("{} min", m))));
    println!("Reminders:     {}", or_dash(principal.study_reminders_enabled.map(|b| on_off(b).to_string())));
    println!("Email notices: {}", or_dash(principal.notification_email.map(|b| on_off(b).to_string())));
    if let Some(last_login) = principal.last_login {
        println!("Last login:    {}", last_login.format("%Y-%m-%d %H:%M"));
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_default(label: &str, default: &str) -> Result<String> {
    print!("{} [{}]: ", label, default);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();
    Ok(if input.is_empty() {
        default.to_string()
    } else {
        input.to_string()
    })
}
