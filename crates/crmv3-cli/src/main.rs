//! crmv3 - command-line client for the crmv3 CRM API.
//!
//! A thin collaborator of `crmv3-core`: every command goes through the
//! shared `SessionManager`, so stored sessions, token refresh and forced
//! logout behave exactly as they do for any other client.

mod cli;

use std::io::{self, Write};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use futures::StreamExt;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crmv3_core::auth::{ExposeSecret, GuardDecision, SessionState, TokenCodec};
use crmv3_core::models::RegisterRequest;
use crmv3_core::{Config, SessionManager};

use cli::{Cli, Commands, GetArgs, LoginArgs, RegisterArgs, RouteArgs};

/// Log file name in the cache directory
const LOG_FILE: &str = "crmv3.log";

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug).
/// Everything goes to stderr and, when the cache directory is known, to a
/// log file there as well.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.cache_dir() {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
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

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.clone();
    }

    let _log_guard = init_tracing(&config);
    info!(api = %config.api_base_url, "crmv3 starting");

    let session = SessionManager::from_config(config.clone())?;
    session.init();
    session.await_ready().await;

    let result = match cli.command {
        Commands::Login(args) => login(&session, config, args).await,
        Commands::Register(args) => register(&session, args).await,
        Commands::Logout => {
            session.logout().await;
            println!("Logged out.");
            Ok(())
        }
        Commands::Status => {
            status(&session);
            Ok(())
        }
        Commands::Whoami => whoami(&session).await,
        Commands::Validate => {
            let valid = session.validate().await;
            println!("{}", if valid { "valid" } else { "invalid" });
            Ok(())
        }
        Commands::Get(args) => get(&session, args).await,
        Commands::Route(args) => route(&session, args).await,
        Commands::Watch => watch(&session).await,
    };

    session.shutdown();
    result
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(session: &SessionManager, mut config: Config, args: LoginArgs) -> Result<()> {
    let username = match args.username.or_else(|| config.last_username.clone()) {
        Some(username) => username,
        None => prompt("Username or email")?,
    };
    let password = match args.password {
        Some(password) => password,
        None => rpassword::prompt_password("Password: ").context("Failed to read password")?,
    };

    let profile = session.login(&username, &password).await?;
    match profile {
        Some(profile) => println!("Logged in as {}.", profile.display_name()),
        None => println!("Logged in as {} (profile unavailable).", username),
    }

    config.last_username = Some(username);
    config.save()?;
    Ok(())
}

async fn register(session: &SessionManager, args: RegisterArgs) -> Result<()> {
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    let request = RegisterRequest {
        username: args.username,
        email: args.email,
        password,
        first_name: args.first_name,
        last_name: args.last_name,
    };
    let response = session.register(&request).await?;
    if response.success {
        println!("Account created. {}", response.message);
    } else {
        println!("Registration refused: {}", response.message);
    }
    Ok(())
}

fn status(session: &SessionManager) {
    let state = session.current_state();
    println!("status: {:?}", state.status());

    let Some(current) = state.session() else {
        return;
    };
    if let Ok(claims) = TokenCodec::decode(current.credentials.access_token.expose_secret()) {
        let remaining = claims.expires_at - Utc::now();
        println!("token expires: {} ({} min left)", claims.expires_at, remaining.num_minutes().max(0));
    }
    if let Some(profile) = &current.profile {
        let roles: Vec<&str> = profile.role_names().collect();
        println!("user: {} <{}>", profile.display_name(), profile.email.as_deref().unwrap_or("-"));
        println!("roles: {}", roles.join(", "));
        if !profile.verified {
            println!("warning: profile derived from unverified token claims");
        }
    }
}

async fn whoami(session: &SessionManager) -> Result<()> {
    let profile = session.refresh_profile().await?;
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

async fn get(session: &SessionManager, args: GetArgs) -> Result<()> {
    let value: serde_json::Value = session.api().get(&args.path).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn route(session: &SessionManager, args: RouteArgs) -> Result<()> {
    let guard = session.route_guard();
    match guard.check(&args.target, args.from.as_deref()).await {
        GuardDecision::Admit => println!("admit"),
        GuardDecision::Redirect(to) => println!("redirect {}", to),
        GuardDecision::Stay => println!("stay"),
    }
    Ok(())
}

async fn watch(session: &SessionManager) -> Result<()> {
    let mut changes = Box::pin(session.state_changes());
    while let Some(state) = changes.next().await {
        let who = match &state {
            SessionState::Authenticated(s) | SessionState::RefreshingInPlace(s) => s
                .profile
                .as_ref()
                .map(|p| p.username.clone())
                .unwrap_or_default(),
            _ => String::new(),
        };
        println!("{:?} {}", state.status(), who);
    }
    Ok(())
}
