//! Wire models for the CRM authentication API.
//!
//! - `LoginRequest`, `RegisterRequest`: request bodies
//! - `AuthResponse`, `RegisterResponse`: response bodies
//! - `UserProfile`: the profile snapshot cached alongside the credentials

pub mod auth;

pub use auth::{AuthResponse, LoginRequest, RegisterRequest, RegisterResponse, UserProfile};
