//! Core library for the crmv3 client.
//!
//! Keeps a short-lived access token and a long-lived refresh token, decides
//! locally whether the session is still usable, and makes sure concurrent
//! requests that hit an expired token share a single refresh exchange.
//!
//! Collaborators hold a [`SessionManager`] and use its API client for
//! protected resources.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use auth::{AuthError, GuardDecision, SessionManager, SessionState, SessionStatus};
pub use config::Config;
