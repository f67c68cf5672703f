//! Command-line definitions.

use clap::{Parser, Subcommand};
use crmv3_core::config::{ENV_PASSWORD, ENV_USERNAME};

/// crmv3 CRM client
#[derive(Parser, Debug)]
#[command(name = "crmv3", version, about = "Command-line client for the crmv3 CRM API")]
pub struct Cli {
    /// API base URL (overrides config and CRMV3_API_URL)
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in and store the session
    Login(LoginArgs),
    /// Create an account
    Register(RegisterArgs),
    /// Log out and forget the stored session
    Logout,
    /// Show the local session state
    Status,
    /// Fetch and show the current user's profile
    Whoami,
    /// Ask the server whether the stored token is still accepted
    Validate,
    /// GET a protected API path and print the JSON response
    Get(GetArgs),
    /// Check whether navigation to a client route would be admitted
    Route(RouteArgs),
    /// Print session state changes as they happen
    Watch,
}

#[derive(Parser, Debug)]
pub struct LoginArgs {
    /// Username or email; defaults to the last one used
    #[arg(short, long, env = ENV_USERNAME)]
    pub username: Option<String>,

    /// Password; prompted for when absent
    #[arg(long, env = ENV_PASSWORD, hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Parser, Debug)]
pub struct RegisterArgs {
    #[arg(long)]
    pub username: String,

    #[arg(long)]
    pub email: String,

    #[arg(long)]
    pub first_name: String,

    #[arg(long)]
    pub last_name: String,
}

#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Path below the API base URL, e.g. /customers
    pub path: String,
}

#[derive(Parser, Debug)]
pub struct RouteArgs {
    /// Target route, e.g. /statistics
    pub target: String,

    /// Route the navigation starts from
    #[arg(long)]
    pub from: Option<String>,
}
