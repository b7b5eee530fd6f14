use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

/// Endpoints of the authorization server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfiguration {
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
}

/// Result of the front-channel authorization step, as carried by the
/// redirect back to the application.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthorizationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
}

/// Tokens issued by the token endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationErrorKind {
    /// `error` returned on the authorization redirect
    Authorization,
    /// `error` returned by the token endpoint
    Token,
    /// Transport or client-side failure
    General,
}

/// A failed authorization or token step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationError {
    pub kind: AuthorizationErrorKind,
    pub error: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<SmolStr>,
}

impl AuthorizationError {
    pub fn new(kind: AuthorizationErrorKind, error: impl Into<SmolStr>) -> Self {
        Self {
            kind,
            error: error.into(),
            error_description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<SmolStr>) -> Self {
        self.error_description = Some(description.into());
        self
    }
}

impl fmt::Display for AuthorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {}", self.error, description),
            None => f.write_str(&self.error),
        }
    }
}

impl std::error::Error for AuthorizationError {}

/// Serialized authorization session: endpoints, the last responses from the
/// authorization server and the last error, if any.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_configuration: Option<ServiceConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_authorization_response: Option<AuthorizationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_token_response: Option<TokenResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_error: Option<AuthorizationError>,
}

impl AuthState {
    pub fn new(service_configuration: ServiceConfiguration) -> Self {
        Self {
            service_configuration: Some(service_configuration),
            ..Default::default()
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.authorization_error.is_none()
            && (self.access_token().is_some() || self.id_token().is_some())
    }

    pub fn access_token(&self) -> Option<&str> {
        if self.authorization_error.is_some() {
            return None;
        }
        self.last_token_response
            .as_ref()
            .and_then(|r| r.access_token.as_deref())
            .or_else(|| {
                self.last_authorization_response
                    .as_ref()
                    .and_then(|r| r.access_token.as_deref())
            })
    }

    pub fn id_token(&self) -> Option<&str> {
        if self.authorization_error.is_some() {
            return None;
        }
        self.last_token_response
            .as_ref()
            .and_then(|r| r.id_token.as_deref())
            .or_else(|| {
                self.last_authorization_response
                    .as_ref()
                    .and_then(|r| r.id_token.as_deref())
            })
    }

    /// Fold in the outcome of the authorization step. A new response starts a
    /// fresh session; only authorization-server errors are recorded.
    pub fn update_after_authorization(
        &mut self,
        outcome: Result<AuthorizationResponse, AuthorizationError>,
    ) {
        match outcome {
            Ok(response) => {
                self.authorization_error = None;
                self.last_token_response = None;
                self.refresh_token = None;
                if response.scope.is_some() {
                    self.scope = response.scope.clone();
                }
                self.last_authorization_response = Some(response);
            }
            Err(error) if error.kind == AuthorizationErrorKind::Authorization => {
                self.authorization_error = Some(error);
            }
            Err(_) => {}
        }
    }

    /// Fold in the outcome of a token request. Only token-endpoint errors are
    /// recorded.
    pub fn update_after_token_response(&mut self, outcome: Result<TokenResponse, AuthorizationError>) {
        match outcome {
            Ok(response) => {
                self.authorization_error = None;
                if response.scope.is_some() {
                    self.scope = response.scope.clone();
                }
                if response.refresh_token.is_some() {
                    self.refresh_token = response.refresh_token.clone();
                }
                self.last_token_response = Some(response);
            }
            Err(error) if error.kind == AuthorizationErrorKind::Token => {
                self.authorization_error = Some(error);
            }
            Err(_) => {}
        }
    }

    /// Same endpoints, no tokens.
    pub fn cleared(&self) -> Self {
        Self {
            service_configuration: self.service_configuration.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceConfiguration {
        ServiceConfiguration {
            authorization_endpoint: Url::parse("https://authEndpoint.com").unwrap(),
            token_endpoint: Url::parse("https://tokenEndpoint.com").unwrap(),
        }
    }

    fn token(access: &str) -> TokenResponse {
        TokenResponse {
            access_token: Some(access.into()),
            token_type: Some("Bearer".into()),
            ..Default::default()
        }
    }

    #[test]
    fn empty_state_is_unauthorized() {
        let state = AuthState::new(service());
        assert!(!state.is_authorized());
        assert_eq!(state.access_token(), None);
    }

    #[test]
    fn authorization_then_token() {
        let mut state = AuthState::new(service());
        state.update_after_authorization(Ok(AuthorizationResponse {
            authorization_code: Some("code".into()),
            access_token: Some("123".into()),
            scope: Some("name dob".into()),
            ..Default::default()
        }));
        assert_eq!(state.access_token(), Some("123"));
        assert_eq!(state.scope.as_deref(), Some("name dob"));

        let mut response = token("234");
        response.refresh_token = Some("refresh".into());
        state.update_after_token_response(Ok(response));
        assert!(state.is_authorized());
        assert_eq!(state.access_token(), Some("234"));
        assert_eq!(state.refresh_token.as_deref(), Some("refresh"));

        // a new authorization discards the previous tokens
        state.update_after_authorization(Ok(AuthorizationResponse {
            authorization_code: Some("code2".into()),
            ..Default::default()
        }));
        assert_eq!(state.access_token(), None);
        assert_eq!(state.refresh_token, None);
    }

    #[test]
    fn only_matching_errors_are_recorded() {
        let mut state = AuthState::new(service());
        state.update_after_token_response(Ok(token("234")));

        state.update_after_token_response(Err(AuthorizationError::new(
            AuthorizationErrorKind::General,
            "network down",
        )));
        assert!(state.is_authorized());

        state.update_after_token_response(Err(AuthorizationError::new(
            AuthorizationErrorKind::Token,
            "invalid_grant",
        )));
        assert!(!state.is_authorized());
        assert_eq!(state.access_token(), None);

        state.update_after_authorization(Err(AuthorizationError::new(
            AuthorizationErrorKind::Authorization,
            "access_denied",
        )
        .with_description("user cancelled")));
        assert_eq!(
            state.authorization_error.as_ref().map(ToString::to_string).as_deref(),
            Some("access_denied: user cancelled")
        );
    }

    #[test]
    fn cleared_keeps_endpoints() {
        let mut state = AuthState::new(service());
        state.update_after_token_response(Ok(token("234")));
        let cleared = state.cleared();
        assert_eq!(cleared.service_configuration, Some(service()));
        assert_eq!(cleared.access_token(), None);
    }

    #[test]
    fn json_shape_is_stable() {
        let mut state = AuthState::new(service());
        state.update_after_token_response(Ok(token("234")));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json["service_configuration"]["token_endpoint"],
            "https://tokenendpoint.com/"
        );
        assert_eq!(json["last_token_response"]["access_token"], "234");
        assert!(json.get("authorization_error").is_none());
        let back: AuthState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
