//! REST API access for the CRM backend.
//!
//! `backend` speaks the authentication protocol, `middleware` applies the
//! bearer/refresh policy to every other call, and `client` offers typed JSON
//! helpers on top of it.

pub mod backend;
pub mod client;
pub mod error;
pub mod middleware;

pub use backend::{AuthBackend, HttpAuthBackend};
pub use client::ApiClient;
pub use error::ApiError;
pub use middleware::{RequestAuthMiddleware, RetryPolicy};
