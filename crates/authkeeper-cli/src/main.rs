//! authkeeper - command-line front end for the admin console's sign-in.
//!
//! Commands:
//!   login [--access TOKEN] [--refresh TOKEN]   store a freshly issued credential
//!   status [--json]                            show auth state, refresh timing and session
//!   whoami                                     print the signed-in user
//!   logout                                     clear the credential and session
//!   watch                                      stay signed in, refreshing until Ctrl-C

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use authkeeper_core::store::KeyValueStore;
use authkeeper_core::{AuthConfig, AuthCoordinator, AuthState};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directory for an additional daily-rotated log file
const LOG_DIR_ENV: &str = "AUTHKEEPER_LOG_DIR";

const USAGE: &str = "Usage: authkeeper <login|status|whoami|logout|watch> [options]

  login [--access TOKEN] [--refresh TOKEN]   prompts for any token not given
  status [--json]
  whoami
  logout
  watch";

/// Initialize the tracing subscriber for logging.
///
/// Returns the file writer guard, which must live as long as logging does.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "authkeeper.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = AuthConfig::load()?;
    info!(base_url = %config.base_url, storage = ?config.storage, "authkeeper starting");
    let origin = config.open_store()?;
    let store: Arc<dyn KeyValueStore> = Arc::new(origin.open_context());
    let (coordinator, _api) = AuthCoordinator::from_config(&config, store)
        .context("Failed to build HTTP client")?;

    let result = match command.as_str() {
        "login" => login(&coordinator, &args[1..]).await,
        "status" => status(&coordinator, args[1..].iter().any(|a| a == "--json")).await,
        "whoami" => whoami(&coordinator).await,
        "logout" => {
            coordinator.logout();
            println!("Logged out");
            Ok(())
        }
        "watch" => {
            // Pick up logins and logouts made by other authkeeper processes
            let _external = origin.spawn_external_watch(config.sync_interval());
            watch(&coordinator).await
        }
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    };

    coordinator.shutdown();
    result
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn prompt_token(label: &str) -> Result<String> {
    let token = rpassword::prompt_password(format!("{}: ", label))?;
    let token = token.trim().to_string();
    if token.is_empty() {
        bail!("{} required", label);
    }
    Ok(token)
}

async fn login(coordinator: &AuthCoordinator, args: &[String]) -> Result<()> {
    let access = match flag_value(args, "--access") {
        Some(token) => token,
        None => prompt_token("Access token")?,
    };
    let refresh = match flag_value(args, "--refresh") {
        Some(token) => token,
        None => prompt_token("Refresh token")?,
    };

    let profile = coordinator
        .login(&access, &refresh)
        .await
        .context("Login failed")?;
    println!("Logged in as {} (scopes: {})", profile.username, profile.scopes_display());
    Ok(())
}

async fn status(coordinator: &AuthCoordinator, json: bool) -> Result<()> {
    let profile = coordinator.start().await?;
    let session = coordinator.session().snapshot();
    let next_refresh = coordinator.next_refresh_in().map(|d| d.as_secs());

    if json {
        let report = serde_json::json!({
            "state": coordinator.state(),
            "profile": profile,
            "next_refresh_secs": next_refresh,
            "session": session,
            "session_expired": coordinator.session().is_expired(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("State:         {}", coordinator.state());
    if let Some(profile) = &profile {
        println!("User:          {}", profile.username);
    }
    if let Some(secs) = next_refresh {
        println!("Next refresh:  in {}s", secs);
    }
    match session.last_activity {
        Some(last) => {
            let idle = chrono::Utc::now() - last;
            let label = if coordinator.session().is_expired() { "expired" } else { "active" };
            println!("Session:       {} (idle {}m)", label, idle.num_minutes());
        }
        None => println!("Session:       none"),
    }
    Ok(())
}

async fn whoami(coordinator: &AuthCoordinator) -> Result<()> {
    match coordinator.start().await? {
        Some(profile) => {
            println!("{}", profile.username);
            if let Some(email) = &profile.email {
                println!("{}", email);
            }
            println!("scopes: {}", profile.scopes_display());
        }
        None => println!("Not logged in"),
    }
    Ok(())
}

/// Keep the session alive, printing state transitions until Ctrl-C.
async fn watch(coordinator: &AuthCoordinator) -> Result<()> {
    let mut states = coordinator.subscribe();
    if coordinator.start().await?.is_none() {
        bail!("Not logged in. Run `authkeeper login` first.");
    }
    println!("Watching session (Ctrl-C to stop)");
    io::stdout().flush()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("{}  {}", chrono::Local::now().format("%H:%M:%S"), state);
                if state == AuthState::Unauthenticated {
                    println!("Signed out");
                    break;
                }
            }
        }
    }
    Ok(())
}
