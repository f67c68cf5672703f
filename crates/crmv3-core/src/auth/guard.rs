//! Navigation guard for the CRM client routes.
//!
//! Decisions wait for session initialization, so a guard evaluated during
//! startup never redirects a user whose stored session is still being
//! restored.

use std::sync::Arc;

use tracing::debug;

use super::state::AuthStateMachine;

pub const LOGIN_ROUTE: &str = "/login";
pub const REGISTER_ROUTE: &str = "/register";
pub const UNAUTHORIZED_ROUTE: &str = "/unauthorized";
pub const DEFAULT_ROUTE: &str = "/dashboard";

/// Who may enter a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Public,
    Authenticated,
    /// Authenticated and holding at least one of the roles.
    Roles(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Segments separated by `/`; `:name` matches any one segment.
    pub pattern: String,
    pub access: Access,
}

impl Route {
    pub fn new(pattern: impl Into<String>, access: Access) -> Self {
        Self {
            pattern: pattern.into(),
            access,
        }
    }

    fn matches(&self, path: &str) -> bool {
        let pattern: Vec<&str> = segments(&self.pattern).collect();
        let path: Vec<&str> = segments(path).collect();
        pattern.len() == path.len()
            && pattern
                .iter()
                .zip(&path)
                .all(|(p, s)| p.starts_with(':') || p == s)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|s| !s.is_empty())
}

/// Ordered route table. First match wins; unknown paths go to `fallback`.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
    fallback: String,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>, fallback: impl Into<String>) -> Self {
        Self {
            routes,
            fallback: fallback.into(),
        }
    }

    /// Routes of the CRM web client.
    pub fn crm() -> Self {
        use Access::*;
        Self::new(
            vec![
                Route::new(LOGIN_ROUTE, Public),
                Route::new(REGISTER_ROUTE, Public),
                Route::new(UNAUTHORIZED_ROUTE, Public),
                Route::new("/dashboard", Authenticated),
                Route::new("/customers", Authenticated),
                Route::new("/customers/new", Authenticated),
                Route::new("/customers/pipeline", Authenticated),
                Route::new("/customers/:id", Authenticated),
                Route::new("/customers/:id/edit", Authenticated),
                Route::new("/statistics", Roles(vec!["ROLE_ADMIN".to_string()])),
            ],
            DEFAULT_ROUTE,
        )
    }

    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::crm()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Admit,
    /// Navigate elsewhere instead.
    Redirect(String),
    /// Refuse without navigating, e.g. already on the login page.
    Stay,
}

pub struct RouteAccessGuard {
    machine: Arc<AuthStateMachine>,
    routes: RouteTable,
}

impl RouteAccessGuard {
    pub fn new(machine: Arc<AuthStateMachine>, routes: RouteTable) -> Self {
        Self { machine, routes }
    }

    /// Decide whether navigation from `current` to `target` may proceed.
    pub async fn check(&self, target: &str, current: Option<&str>) -> GuardDecision {
        self.machine.await_ready().await;

        let Some(route) = self.routes.resolve(target) else {
            debug!(route = target, fallback = %self.routes.fallback, "Unknown route");
            return GuardDecision::Redirect(self.routes.fallback.clone());
        };

        let required = match &route.access {
            Access::Public => return GuardDecision::Admit,
            Access::Authenticated => None,
            Access::Roles(roles) => Some(roles),
        };

        if !self.machine.current_state().is_authenticated() {
            let on_auth_page = matches!(current, Some(LOGIN_ROUTE) | Some(REGISTER_ROUTE));
            debug!(route = target, "Not authenticated");
            return if on_auth_page {
                GuardDecision::Stay
            } else {
                GuardDecision::Redirect(LOGIN_ROUTE.to_string())
            };
        }

        match required {
            Some(roles) if !roles.iter().any(|role| self.machine.has_role(role)) => {
                debug!(route = target, ?roles, "Missing required role");
                GuardDecision::Redirect(UNAUTHORIZED_ROUTE.to_string())
            }
            _ => GuardDecision::Admit,
        }
    }
}
