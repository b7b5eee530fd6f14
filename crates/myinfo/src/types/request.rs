use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationResponseType {
    Code,
}

/// Query of the front-channel authorization request. `authmode`,
/// `attributes` and `purpose` are MyInfo extensions.
#[derive(Serialize, Debug)]
pub struct AuthorizationRequestParameters<'a> {
    pub client_id: &'a str,
    pub response_type: AuthorizationResponseType,
    pub redirect_uri: &'a str,
    pub scope: &'a str,
    pub state: &'a str,
    pub authmode: &'a str,
    pub attributes: &'a str,
    pub purpose: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenGrantType {
    AuthorizationCode,
    RefreshToken,
}

#[derive(Serialize, Debug)]
pub struct TokenRequestParameters<'a> {
    // https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.3
    pub grant_type: TokenGrantType,
    pub code: &'a str,
    pub redirect_uri: &'a str,
}

#[derive(Serialize, Debug)]
pub struct RefreshRequestParameters<'a> {
    // https://datatracker.ietf.org/doc/html/rfc6749#section-6
    pub grant_type: TokenGrantType,
    pub refresh_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<&'a str>,
}

/// Parameters the authorization server appends to the redirect URI.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<SmolStr>,
}

impl CallbackParams {
    /// Read the parameters from the query of a redirect URL, or from its
    /// fragment when the query is empty.
    pub fn from_url(url: &Url) -> Result<Self, serde_html_form::de::Error> {
        let raw = url
            .query()
            .filter(|q| !q.is_empty())
            .or_else(|| url.fragment())
            .unwrap_or_default();
        serde_html_form::from_str(raw)
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
