//! StudioFlow CLI - sign in to the StudioFlow API and query it from a terminal.
//!
//! Drives the same auth stack the mobile shell uses: tokens live in the OS
//! keychain (or an encrypted vault), expired access tokens are refreshed
//! transparently, and a failed refresh signs the user out.

use std::io::{self, BufRead, Write};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use studioflow_core::api::ApiRequest;
use studioflow_core::{AppContext, AuthState, Config};

// ============================================================================
// Constants
// ============================================================================

/// Log file written to the cache directory
const LOG_FILE: &str = "studioflow.log";

const ENV_USERNAME: &str = "STUDIOFLOW_USERNAME";
const ENV_PASSWORD: &str = "STUDIOFLOW_PASSWORD";
const ENV_VAULT_PASSPHRASE: &str = "STUDIOFLOW_VAULT_PASSPHRASE";

const USAGE: &str = "\
Usage: studioflow <command>

Commands:
  login [username]   Sign in and store the token pair
  logout             Forget the stored tokens
  status             Show the current session and granted modules
  get <path>         GET an API path and print the JSON response

Environment:
  STUDIOFLOW_API_URL            API root (overrides config.json)
  STUDIOFLOW_USERNAME           Username for `login`
  STUDIOFLOW_PASSWORD           Password for `login` (skips the prompt)
  STUDIOFLOW_VAULT_PASSPHRASE   Passphrase for the encrypted file backend
  RUST_LOG                      Log filter (default: warn)";

/// Initialize the tracing subscriber for logging.
///
/// Stderr gets the `RUST_LOG` filtered output; when the cache directory is
/// available everything is also appended to `studioflow.log`. The returned
/// guard flushes the file writer and must outlive `main`'s work.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.cache_dir() {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
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

    let mut config = Config::load()
        .context("Failed to load configuration")?
        .with_env_overrides();
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "help" | "-h" | "--help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let passphrase = std::env::var(ENV_VAULT_PASSPHRASE).ok();
    let backend = AppContext::open_backend(&config, passphrase.as_deref())?;
    let ctx = AppContext::new(&config, backend)?;
    info!(command = command, base_url = %config.base_url, "StudioFlow CLI starting");

    let result = match command {
        "login" => login(&ctx, &mut config, args.get(1).cloned()).await,
        "logout" => {
            ctx.auth().sign_out();
            println!("Signed out.");
            Ok(())
        }
        "status" => status(&ctx).await,
        "get" => match args.get(1) {
            Some(path) => get(&ctx, path).await,
            None => Err(anyhow!("Missing path. Usage: studioflow get <path>")),
        },
        other => Err(anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    };

    ctx.shutdown();
    result
}

// ============================================================================
// Commands
// ============================================================================

async fn login(ctx: &AppContext, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username
        .or_else(|| std::env::var(ENV_USERNAME).ok())
        .or_else(|| config.last_username.clone())
    {
        Some(username) => username,
        None => prompt("Username: ")?,
    };
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password(format!("Password for {}: ", username))
            .context("Failed to read password")?,
    };

    match ctx.auth().sign_in(&username, &password).await {
        AuthState::Authenticated(session) => {
            println!("Signed in as {} ({}).", session.user.full_name, session.user.role);
            config.last_username = Some(username);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to remember username");
            }
            Ok(())
        }
        state => bail!(state.error().unwrap_or("Sign-in did not complete.").to_string()),
    }
}

async fn status(ctx: &AppContext) -> Result<()> {
    match ctx.auth().bootstrap().await {
        AuthState::Authenticated(session) => {
            println!("Signed in as {} <{}>", session.user.full_name, session.user.email);
            println!("  username: {}", session.user.username);
            println!("  role:     {}", session.user.role);
            println!("  since:    {}", session.fetched_at.format("%Y-%m-%d %H:%M:%S UTC"));
            let modules = session.granted_modules();
            if modules.is_empty() {
                println!("  modules:  (none)");
            } else {
                println!("  modules:  {}", modules.join(", "));
            }
        }
        AuthState::Unauthenticated(_) => println!("Not signed in."),
        other => println!("Session state: {:?}", other),
    }
    Ok(())
}

async fn get(ctx: &AppContext, path: &str) -> Result<()> {
    if !ctx.auth().bootstrap().await.is_authenticated() {
        bail!("Not signed in. Run `studioflow login` first.");
    }

    let response = ctx.pipeline().execute(ApiRequest::get(path)).await?;
    if response.is_empty() {
        println!("{}", response.status);
        return Ok(());
    }
    match response.json::<Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let line = line.trim().to_string();
    if line.is_empty() {
        bail!("Enter your username and password.");
    }
    Ok(line)
}
