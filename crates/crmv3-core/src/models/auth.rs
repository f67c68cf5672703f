use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix some servers put in front of role names (`ROLE_ADMIN`).
const ROLE_PREFIX: &str = "ROLE_";

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username_or_email: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(username_or_email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username_or_email: username_or_email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username_or_email", &self.username_or_email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

impl fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .finish()
    }
}

/// Response of `/auth/login` and `/auth/refresh`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user_id: Option<i64>,
}

/// Profile of the signed-in user.
///
/// The server reports a single `role`; older builds report a `roles` list.
/// Both are accepted and merged by [`UserProfile::role_names`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    #[serde(default, alias = "id")]
    pub user_id: Option<i64>,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub last_login: Option<String>,
    /// False when the profile was synthesized from unverified token claims.
    #[serde(default = "default_true")]
    pub verified: bool,
}

fn default_true() -> bool {
    true
}

impl UserProfile {
    pub fn role_names(&self) -> impl Iterator<Item = &str> {
        self.role.as_deref().into_iter().chain(self.roles.iter().map(String::as_str))
    }

    /// Role check tolerant of case and of a `ROLE_` prefix on either side.
    pub fn has_role(&self, role: &str) -> bool {
        let wanted = normalize_role(role);
        if wanted.is_empty() {
            return false;
        }
        self.role_names().any(|r| normalize_role(r) == wanted)
    }

    pub fn display_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) if !first.is_empty() && !last.is_empty() => {
                format!("{} {}", first, last)
            }
            _ => self.username.clone(),
        }
    }
}

fn normalize_role(role: &str) -> String {
    let upper = role.trim().to_ascii_uppercase();
    match upper.strip_prefix(ROLE_PREFIX) {
        Some(stripped) => stripped.to_string(),
        None => upper,
    }
}
