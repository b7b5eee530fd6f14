use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use http::{Method, Request};
use myinfo_common::http_client::HttpClient;
use openssl::pkey::{PKey, Public};
use smol_str::{SmolStr, format_smolstr};
use tokio::sync::RwLock;
use url::Url;

use crate::AUTH_MODE;
use crate::authstate::AuthStateManager;
use crate::config::MyInfoConfig;
use crate::error::{MyInfoError, Result};
use crate::jose::{self, jwt::Claims};
use crate::person::Person;
use crate::request::{self, RequestError};
use crate::signing::{PkiSigner, SigningError, with_bearer};
use crate::state::{
    AuthState, AuthorizationError, AuthorizationErrorKind, AuthorizationResponse,
    ServiceConfiguration,
};
use crate::storage::MyInfoStorage;
use crate::types::{AuthorizationRequestParameters, AuthorizationResponseType, CallbackParams};
use crate::utils::generate_state;

/// A prepared front-channel authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub state: SmolStr,
    pub url: Url,
}

/// MyInfo client: owns the authorization state and drives login, token
/// exchange and person retrieval.
pub struct MyInfoClient<T, S> {
    config: Arc<MyInfoConfig>,
    state: Arc<AuthStateManager<S>>,
    client: Arc<T>,
    pending: Arc<RwLock<Option<AuthorizationRequest>>>,
    verification_key: Option<Arc<PKey<Public>>>,
}

impl<T, S> Clone for MyInfoClient<T, S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: self.state.clone(),
            client: self.client.clone(),
            pending: self.pending.clone(),
            verification_key: self.verification_key.clone(),
        }
    }
}

impl<T, S> MyInfoClient<T, S>
where
    T: HttpClient + Send + Sync,
    S: MyInfoStorage,
{
    /// Set up the client against persisted state.
    ///
    /// State stored under a different configuration is discarded. The
    /// service configuration is created from the configured endpoints when
    /// none is stored, and an authorization request is prepared.
    pub async fn new(config: MyInfoConfig, storage: S, client: T) -> Result<Self> {
        let state = AuthStateManager::new(storage);
        let last_hash = state.storage().last_known_config_hash().await?;
        if last_hash.as_deref() != Some(config.hash()) {
            tracing::info!("configuration change detected, discarding old state");
            state.replace(AuthState::default()).await?;
            state.storage().accept_configuration(config.hash()).await?;
        } else {
            tracing::debug!("configuration unchanged");
        }

        if state.current().await?.service_configuration.is_none() {
            tracing::info!(
                authorization_endpoint = %config.authorization_endpoint,
                token_endpoint = %config.token_endpoint,
                "creating service configuration"
            );
            state
                .replace(AuthState::new(ServiceConfiguration {
                    authorization_endpoint: config.authorization_endpoint.clone(),
                    token_endpoint: config.token_endpoint.clone(),
                }))
                .await?;
        }

        let this = Self {
            config: Arc::new(config),
            state: Arc::new(state),
            client: Arc::new(client),
            pending: Arc::new(RwLock::new(None)),
            verification_key: None,
        };
        this.prepare_authorization_request().await?;
        Ok(this)
    }

    /// Verify person payload signatures against this MyInfo public key.
    /// Without one, the signed payload is only decoded.
    pub fn with_verification_key(mut self, key: PKey<Public>) -> Self {
        self.verification_key = Some(Arc::new(key));
        self
    }

    pub fn configuration(&self) -> &MyInfoConfig {
        &self.config
    }

    /// Snapshot of the authorization state.
    pub async fn auth_state(&self) -> Result<AuthState> {
        Ok(self.state.current().await?)
    }

    /// Build a fresh authorization request with a new `state` value,
    /// replacing any pending one.
    pub async fn prepare_authorization_request(&self) -> Result<AuthorizationRequest> {
        let endpoint = self
            .state
            .current()
            .await?
            .service_configuration
            .map(|s| s.authorization_endpoint)
            .unwrap_or_else(|| self.config.authorization_endpoint.clone());
        let state = generate_state();
        let query = serde_html_form::to_string(AuthorizationRequestParameters {
            client_id: &self.config.client_id,
            response_type: AuthorizationResponseType::Code,
            redirect_uri: self.config.redirect_uri.as_str(),
            scope: &self.config.scope,
            state: &state,
            authmode: AUTH_MODE,
            attributes: &self.config.attributes,
            purpose: &self.config.purpose,
        })
        .map_err(RequestError::from)?;
        let mut url = endpoint;
        url.set_query(Some(&query));

        let request = AuthorizationRequest { state, url };
        *self.pending.write().await = Some(request.clone());
        Ok(request)
    }

    /// URL to open in the browser to start the login.
    pub async fn authorization_url(&self) -> Result<Url> {
        if let Some(pending) = self.pending.read().await.as_ref() {
            return Ok(pending.url.clone());
        }
        Ok(self.prepare_authorization_request().await?.url)
    }

    /// Authorized, and the stored state belongs to the current configuration.
    pub async fn is_authorized(&self) -> Result<bool> {
        let authorized = self.state.current().await?.is_authorized();
        Ok(authorized && !self.configuration_changed().await?)
    }

    pub async fn configuration_changed(&self) -> Result<bool> {
        let last = self.state.storage().last_known_config_hash().await?;
        Ok(last.as_deref() != Some(self.config.hash()))
    }

    /// Handle the redirect URL the authorization server sent the user to.
    pub async fn on_post_login_url(&self, redirect: &Url) -> Result<SmolStr> {
        let params = CallbackParams::from_url(redirect)?;
        self.on_post_login(params).await
    }

    /// Handle the redirect parameters. On success, returns the new access
    /// token.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn on_post_login(&self, params: CallbackParams) -> Result<SmolStr> {
        if params.is_empty() {
            return Err(MyInfoError::EmptyCallback);
        }

        if let Some(error) = params.error {
            let mut error = AuthorizationError::new(AuthorizationErrorKind::Authorization, error);
            error.error_description = params.error_description;
            tracing::warn!(error = %error, "authorization failed");
            self.state
                .update_after_authorization(Err(error.clone()))
                .await?;
            return Err(MyInfoError::AuthorizationFailed(error));
        }

        let Some(code) = params.code else {
            return Err(MyInfoError::NoAuthorizationState);
        };

        let expected = self.pending.read().await.as_ref().map(|p| p.state.clone());
        if expected.is_none() || expected != params.state {
            return Err(MyInfoError::StateMismatch);
        }

        self.state
            .update_after_authorization(Ok(AuthorizationResponse {
                state: params.state,
                authorization_code: Some(code.clone()),
                // MyInfo redirects carry no scope; the requested one applies
                scope: params.scope.or_else(|| Some(self.config.scope.clone())),
                ..Default::default()
            }))
            .await?;
        // the state value is single use
        self.prepare_authorization_request().await?;

        match request::exchange_code(self.client.as_ref(), &self.config, &code).await {
            Ok(token) => {
                let state = self.state.update_after_token_response(Ok(token)).await?;
                state
                    .access_token()
                    .map(SmolStr::from)
                    .ok_or(MyInfoError::AccessTokenNotFound)
            }
            Err(e) => {
                let error = e.to_authorization_error();
                tracing::warn!(error = %error, "authorization code exchange failed");
                self.state
                    .update_after_token_response(Err(error.clone()))
                    .await?;
                Err(MyInfoError::CodeExchange {
                    reason: format_smolstr!("{error}"),
                    source: e,
                })
            }
        }
    }

    pub async fn authorization_endpoint(&self) -> Result<Option<Url>> {
        Ok(self
            .state
            .current()
            .await?
            .service_configuration
            .map(|s| s.authorization_endpoint))
    }

    pub async fn latest_access_token(&self) -> Result<Option<SmolStr>> {
        Ok(self.state.current().await?.access_token().map(SmolStr::from))
    }

    /// Whether the access token is missing or past its `exp` claim.
    pub async fn access_token_expired(&self) -> Result<bool> {
        let Some(token) = self.latest_access_token().await? else {
            return Ok(true);
        };
        let claims = Claims::decode_unverified(&token)
            .map_err(|e| MyInfoError::InvalidAccessToken(Some(e)))?;
        Ok(claims.is_expired(Utc::now()))
    }

    /// Obtain a new access token with the stored refresh token.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn refresh(&self) -> Result<SmolStr> {
        let current = self.state.current().await?;
        let outcome = request::refresh(
            self.client.as_ref(),
            &self.config,
            current.refresh_token.as_deref(),
            current.scope.as_deref(),
        )
        .await;
        match outcome {
            Ok(token) => {
                let state = self.state.update_after_token_response(Ok(token)).await?;
                state
                    .access_token()
                    .map(SmolStr::from)
                    .ok_or(MyInfoError::AccessTokenNotFound)
            }
            Err(e) => {
                self.state
                    .update_after_token_response(Err(e.to_authorization_error()))
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Forget the tokens, keeping the service configuration.
    pub async fn logout(&self) -> Result<()> {
        self.state.logout().await?;
        self.prepare_authorization_request().await?;
        tracing::info!("logged out");
        Ok(())
    }

    /// Fetch the configured attributes of the logged in person.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn get_person(&self) -> Result<Person> {
        let access_token = self
            .latest_access_token()
            .await?
            .filter(|t| !t.is_empty())
            .ok_or(MyInfoError::AccessTokenNotFound)?;
        let claims = Claims::decode_unverified(&access_token)
            .map_err(|e| MyInfoError::InvalidAccessToken(Some(e)))?;
        let sub = claims.sub.ok_or(MyInfoError::InvalidAccessToken(None))?;

        let mut url = Url::parse(self.config.host())?;
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["person", sub.as_str(), ""]);
        let mut params = BTreeMap::new();
        params.insert(SmolStr::new_static("client_id"), self.config.client_id.clone());
        params.insert(SmolStr::new_static("attributes"), self.config.attributes.clone());

        let authorization = if self.config.environment.requires_pki() {
            let keystore = self.config.keystore().ok_or(SigningError::NoKey)?;
            let header = PkiSigner::new(keystore.private_key(), &self.config.client_id)
                .debug_log(self.config.debug_log())
                .authorization(&Method::GET, &url, &params)?;
            with_bearer(&header, &access_token)
        } else {
            format_smolstr!("Bearer {access_token}")
        };

        let mut request_url = url.clone();
        request_url.query_pairs_mut().extend_pairs(params.iter());
        let req = Request::builder()
            .uri(request_url.as_str())
            .method(Method::GET)
            .header(http::header::AUTHORIZATION, authorization.as_str())
            .header("Cache-Control", "no-cache")
            .body(Vec::new())?;

        tracing::debug!(environment = %self.config.environment, "fetching person");
        let res = self
            .client
            .send_http(req)
            .await
            .map_err(|e| MyInfoError::Transport(Box::new(e)))?;

        if !res.status().is_success() {
            let body = String::from_utf8_lossy(res.body());
            return Err(MyInfoError::Server {
                status: res.status(),
                body: body.trim().into(),
            });
        }
        let body = res.body();
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(MyInfoError::EmptyResponse);
        }

        if self.config.environment.requires_pki() {
            let keystore = self.config.keystore().ok_or(SigningError::NoKey)?;
            let payload = jose::open_person_payload(
                &String::from_utf8_lossy(body),
                keystore.private_key(),
                self.verification_key.as_deref(),
            )?;
            Ok(Person::from_slice(&payload)?)
        } else {
            Ok(Person::from_slice(body)?)
        }
    }
}
