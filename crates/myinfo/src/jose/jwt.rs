use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;

use super::{JoseError, decode_segment, split_compact};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimsAud {
    Single(SmolStr),
    Multiple(Vec<SmolStr>),
}

/// Claims of a MyInfo access token. The token is only decoded, never
/// verified: it is passed back to the issuer, which does the checking.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<ClaimsAud>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<SmolStr>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Claims {
    /// Decode the claims of a compact JWT without checking its signature.
    pub fn decode_unverified(token: &str) -> Result<Self, JoseError> {
        let [_, payload, _] = split_compact::<3>(token)?;
        Ok(serde_json::from_slice(&decode_segment(payload)?)?)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }

    /// Tokens without `exp` never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at < now)
    }
}
