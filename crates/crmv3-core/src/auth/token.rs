//! Client-side access token inspection.
//!
//! Claims are read without verifying the signature. They are only good for
//! local, non-authoritative decisions such as "has this token already
//! expired"; the server remains the judge of validity.

use std::fmt;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::error::DecodeError;
use crate::models::UserProfile;

/// base64url that tolerates both padded and unpadded segments.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    NO_PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// An opaque bearer secret.
///
/// Wraps a [`SecretString`], so the value is zeroized on drop and `Debug`
/// never prints it. Read it through [`ExposeSecret`].
#[derive(Clone)]
pub struct BearerToken(SecretString);

impl BearerToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().trim().is_empty()
    }
}

impl ExposeSecret<str> for BearerToken {
    fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl PartialEq for BearerToken {
    fn eq(&self, other: &Self) -> bool {
        self.expose_secret() == other.expose_secret()
    }
}

impl Eq for BearerToken {}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

// Only the credential store serializes tokens.
impl Serialize for BearerToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose_secret())
    }
}

impl<'de> Deserialize<'de> for BearerToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Claims recovered from an access token.
///
/// Derived on demand from the token; never stored on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub subject: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub roles: Vec<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl Claims {
    /// Zero grace period: a token exactly at its expiry instant is expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Build a stand-in profile from the claims. The result is marked
    /// unverified because the claims were never checked against a signature.
    pub fn to_unverified_profile(&self) -> UserProfile {
        let username = self
            .username
            .clone()
            .or_else(|| self.subject.clone())
            .unwrap_or_default();
        UserProfile {
            user_id: self.subject.as_deref().and_then(|s| s.parse().ok()),
            username,
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            role: None,
            roles: self.roles.clone(),
            enabled: true,
            created_at: None,
            last_login: None,
            verified: false,
        }
    }
}

pub struct TokenCodec;

impl TokenCodec {
    pub fn decode(token: &str) -> Result<Claims, DecodeError> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(header), Some(payload), Some(_signature), None)
                if !header.is_empty() && !payload.is_empty() =>
            {
                payload
            }
            _ => return Err(DecodeError::MalformedToken),
        };

        let bytes = URL_SAFE_LENIENT
            .decode(payload)
            .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;
        let claims: Map<String, Value> = serde_json::from_slice(&bytes)
            .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;

        let expires_at = match claims.get("exp") {
            None | Some(Value::Null) => return Err(DecodeError::MissingExpiry),
            Some(value) => timestamp_claim(value).ok_or(DecodeError::InvalidExpiry)?,
        };

        Ok(Claims {
            subject: string_claim(&claims, "sub"),
            expires_at,
            issued_at: claims.get("iat").and_then(timestamp_claim),
            roles: role_claims(&claims),
            username: string_claim(&claims, "username"),
            email: string_claim(&claims, "email"),
            first_name: string_claim(&claims, "firstName"),
            last_name: string_claim(&claims, "lastName"),
        })
    }

    /// Local expiry check. Undecodable tokens count as expired.
    pub fn is_expired(token: &str, now: DateTime<Utc>) -> bool {
        match Self::decode(token) {
            Ok(claims) => claims.is_expired_at(now),
            Err(_) => true,
        }
    }
}

fn timestamp_claim(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                DateTime::from_timestamp(secs, 0)
            } else {
                let secs = n.as_f64()?;
                if !secs.is_finite() {
                    return None;
                }
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9) as u32;
                DateTime::from_timestamp(whole as i64, nanos)
            }
        }
        _ => None,
    }
}

fn string_claim(claims: &Map<String, Value>, key: &str) -> Option<String> {
    match claims.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Collect roles from `role`, `roles` and `authorities` claims.
fn role_claims(claims: &Map<String, Value>) -> Vec<String> {
    let mut roles = Vec::new();
    if let Some(Value::String(role)) = claims.get("role") {
        roles.push(role.clone());
    }
    for key in ["roles", "authorities"] {
        if let Some(Value::Array(items)) = claims.get(key) {
            for item in items {
                match item {
                    Value::String(s) => roles.push(s.clone()),
                    Value::Object(obj) => {
                        if let Some(Value::String(s)) = obj.get("authority") {
                            roles.push(s.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    roles
}
