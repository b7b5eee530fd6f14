use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::state::TokenResponse;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthTokenType {
    #[serde(alias = "bearer", alias = "BEARER")]
    Bearer,
}

impl OAuthTokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthTokenType::Bearer => "Bearer",
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-5.1
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OAuthTokenResponse {
    pub access_token: SmolStr,
    pub token_type: OAuthTokenType,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<SmolStr>,
    pub scope: Option<SmolStr>,
    pub id_token: Option<SmolStr>,
}

impl OAuthTokenResponse {
    /// Convert to the persisted form, fixing `expires_in` against `now`.
    /// A lifetime too large to represent is dropped.
    pub fn into_token_response(self, now: DateTime<Utc>) -> TokenResponse {
        TokenResponse {
            access_token_expires_at: self
                .expires_in
                .and_then(TimeDelta::try_seconds)
                .and_then(|d| now.checked_add_signed(d)),
            access_token: Some(self.access_token),
            token_type: Some(self.token_type.as_str().into()),
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            scope: self.scope,
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-5.2
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OAuthErrorResponse {
    pub error: SmolStr,
    pub error_description: Option<SmolStr>,
}
