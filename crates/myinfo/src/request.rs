use std::collections::BTreeMap;

use chrono::Utc;
use http::{Method, Request, StatusCode};
use myinfo_common::http_client::HttpClient;
use myinfo_common::store::StoreError;
use serde::Serialize;
use serde_json::Value;
use smol_str::SmolStr;
use url::Url;

use crate::config::MyInfoConfig;
use crate::signing::{PkiSigner, SigningError};
use crate::state::{AuthorizationError, AuthorizationErrorKind, TokenResponse};
use crate::types::{
    OAuthErrorResponse, OAuthTokenResponse, RefreshRequestParameters, TokenGrantType,
    TokenRequestParameters,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Token endpoint request error
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("{kind}")]
pub struct RequestError {
    #[diagnostic_source]
    kind: RequestErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<SmolStr>,
    context: Option<SmolStr>,
    url: Option<SmolStr>,
}

/// Error categories for token endpoint requests
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RequestErrorKind {
    /// No refresh token available
    #[error("no refresh token available")]
    #[diagnostic(
        code(myinfo::request::no_refresh_token),
        help("log in again to obtain a new authorization code")
    )]
    NoRefreshToken,

    /// Request could not be signed
    #[error("request signing failed")]
    #[diagnostic(code(myinfo::request::signing))]
    Signing,

    /// State storage error
    #[error("storage error")]
    #[diagnostic(code(myinfo::request::storage))]
    Storage,

    /// HTTP build error
    #[error("http build error")]
    #[diagnostic(code(myinfo::request::http_build))]
    HttpBuild,

    /// Transport error from the HTTP client
    #[error("transport error")]
    #[diagnostic(
        code(myinfo::request::transport),
        help("check network connectivity to the MyInfo API host")
    )]
    Transport,

    /// HTTP status error
    #[error("http status: {0}")]
    #[diagnostic(
        code(myinfo::request::http_status),
        help("see server response for details")
    )]
    HttpStatus(StatusCode),

    /// HTTP status with error body
    #[error("http status: {status}, body: {body}")]
    #[diagnostic(
        code(myinfo::request::http_status_body),
        help("server returned error JSON; inspect fields like `error`, `error_description`")
    )]
    HttpStatusWithBody { status: StatusCode, body: Value },

    /// Form serialization error
    #[error("form serialization error")]
    #[diagnostic(code(myinfo::request::serde_form))]
    SerdeHtmlForm,

    /// JSON error
    #[error("json error")]
    #[diagnostic(code(myinfo::request::serde_json))]
    SerdeJson,
}

impl RequestError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RequestErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
            url: None,
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> &RequestErrorKind {
        &self.kind
    }

    /// Get the context string if present
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Get the URL if present
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Add help text to this error
    pub fn with_help(mut self, help: impl Into<SmolStr>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context to this error
    pub fn with_context(mut self, context: impl Into<SmolStr>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Add URL to this error
    pub fn with_url(mut self, url: impl Into<SmolStr>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn no_refresh_token() -> Self {
        Self::new(RequestErrorKind::NoRefreshToken, None)
    }

    pub fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(RequestErrorKind::Transport, Some(Box::new(source)))
    }

    pub fn http_status(status: StatusCode) -> Self {
        Self::new(RequestErrorKind::HttpStatus(status), None)
    }

    pub fn http_status_with_body(status: StatusCode, body: Value) -> Self {
        Self::new(RequestErrorKind::HttpStatusWithBody { status, body }, None)
    }

    /// The OAuth `error` object returned by the server, if any.
    pub fn oauth_error(&self) -> Option<OAuthErrorResponse> {
        match &self.kind {
            RequestErrorKind::HttpStatusWithBody { body, .. } => {
                serde_json::from_value(body.clone()).ok()
            }
            _ => None,
        }
    }

    /// Form recorded in [`crate::state::AuthState`]. Server-side OAuth errors
    /// are token errors; everything else is a general failure.
    pub fn to_authorization_error(&self) -> AuthorizationError {
        match self.oauth_error() {
            Some(OAuthErrorResponse {
                error,
                error_description,
            }) => AuthorizationError {
                kind: AuthorizationErrorKind::Token,
                error,
                error_description,
            },
            None => AuthorizationError::new(
                AuthorizationErrorKind::General,
                smol_str::format_smolstr!("{self}"),
            ),
        }
    }
}

impl From<SigningError> for RequestError {
    fn from(e: SigningError) -> Self {
        let msg = smol_str::format_smolstr!("{e}");
        Self::new(RequestErrorKind::Signing, Some(Box::new(e))).with_context(msg)
    }
}

impl From<StoreError> for RequestError {
    fn from(e: StoreError) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(RequestErrorKind::Storage, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify the state store is accessible and writable")
    }
}

impl From<http::Error> for RequestError {
    fn from(e: http::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(RequestErrorKind::HttpBuild, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify request URIs and headers are valid")
    }
}

impl From<serde_html_form::ser::Error> for RequestError {
    fn from(e: serde_html_form::ser::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(RequestErrorKind::SerdeHtmlForm, Some(Box::new(e)))
            .with_context(msg)
            .with_help("check request parameters are serializable")
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(e: serde_json::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(RequestErrorKind::SerdeJson, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify the response body is valid JSON")
    }
}

pub type Result<T> = core::result::Result<T, RequestError>;

/// How the client authenticates to the token endpoint.
#[derive(Clone, Copy)]
pub enum ClientAuth<'a> {
    /// `client_id` and `client_secret` in the form body (sandbox).
    SecretPost {
        client_id: &'a str,
        client_secret: &'a str,
    },
    /// As `SecretPost`, plus a `PKI_SIGN` `Authorization` header over the
    /// same parameters (test, production).
    PkiSign {
        client_id: &'a str,
        client_secret: &'a str,
        signer: PkiSigner<'a>,
    },
}

impl<'a> ClientAuth<'a> {
    pub fn for_config(config: &'a MyInfoConfig) -> Result<Self> {
        if !config.environment.requires_pki() {
            return Ok(ClientAuth::SecretPost {
                client_id: &config.client_id,
                client_secret: &config.client_secret,
            });
        }
        let keystore = config.keystore().ok_or(SigningError::NoKey)?;
        Ok(ClientAuth::PkiSign {
            client_id: &config.client_id,
            client_secret: &config.client_secret,
            signer: PkiSigner::new(keystore.private_key(), &config.client_id)
                .debug_log(config.debug_log()),
        })
    }

    fn credentials(&self) -> (&'a str, &'a str) {
        match *self {
            ClientAuth::SecretPost {
                client_id,
                client_secret,
            }
            | ClientAuth::PkiSign {
                client_id,
                client_secret,
                ..
            } => (client_id, client_secret),
        }
    }
}

/// Flatten a serializable parameter struct into sorted string pairs,
/// skipping absent values.
pub fn to_params(value: &impl Serialize) -> Result<BTreeMap<SmolStr, SmolStr>> {
    let Value::Object(map) = serde_json::to_value(value)? else {
        return Ok(BTreeMap::new());
    };
    Ok(map
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::String(s) => Some((k.into(), s.into())),
            other => Some((k.into(), smol_str::format_smolstr!("{other}"))),
        })
        .collect())
}

/// Exchange an authorization code at the token endpoint.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn exchange_code<T>(
    client: &T,
    config: &MyInfoConfig,
    code: &str,
) -> Result<TokenResponse>
where
    T: HttpClient + ?Sized,
{
    let params = TokenRequestParameters {
        grant_type: TokenGrantType::AuthorizationCode,
        code,
        redirect_uri: config.redirect_uri.as_str(),
    };
    let auth = ClientAuth::for_config(config)?;
    let response = token_request(client, &config.token_endpoint, auth, &params).await?;
    tracing::debug!(
        expires_in = ?response.expires_in,
        has_refresh_token = response.refresh_token.is_some(),
        "authorization code exchanged"
    );
    Ok(response.into_token_response(Utc::now()))
}

/// Use a refresh token to obtain a new access token.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn refresh<T>(
    client: &T,
    config: &MyInfoConfig,
    refresh_token: Option<&str>,
    scope: Option<&str>,
) -> Result<TokenResponse>
where
    T: HttpClient + ?Sized,
{
    let refresh_token = refresh_token.ok_or_else(RequestError::no_refresh_token)?;
    let params = RefreshRequestParameters {
        grant_type: TokenGrantType::RefreshToken,
        refresh_token,
        scope,
    };
    let auth = ClientAuth::for_config(config)?;
    let response = token_request(client, &config.token_endpoint, auth, &params).await?;
    tracing::debug!(expires_in = ?response.expires_in, "access token refreshed");
    Ok(response.into_token_response(Utc::now()))
}

pub async fn token_request<T, P>(
    client: &T,
    token_endpoint: &Url,
    auth: ClientAuth<'_>,
    params: &P,
) -> Result<OAuthTokenResponse>
where
    T: HttpClient + ?Sized,
    P: Serialize,
{
    let mut form = to_params(params)?;
    let (client_id, client_secret) = auth.credentials();
    form.insert("client_id".into(), client_id.into());
    form.insert("client_secret".into(), client_secret.into());
    let body = serde_html_form::to_string(&form)?;

    let mut builder = Request::builder()
        .uri(token_endpoint.as_str())
        .method(Method::POST)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Cache-Control", "no-cache");
    if let ClientAuth::PkiSign { signer, .. } = auth {
        let header = signer.authorization(&Method::POST, token_endpoint, &form)?;
        builder = builder.header(http::header::AUTHORIZATION, header.as_str());
    }
    let req = builder.body(body.into_bytes())?;

    let res = client
        .send_http(req)
        .await
        .map_err(|e| RequestError::transport(e).with_url(token_endpoint.as_str()))?;
    if res.status() == StatusCode::OK {
        Ok(serde_json::from_slice(res.body())?)
    } else if res.status().is_client_error() {
        let body = serde_json::from_slice(res.body()).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(res.body()).into_owned())
        });
        Err(RequestError::http_status_with_body(res.status(), body)
            .with_url(token_endpoint.as_str()))
    } else {
        Err(RequestError::http_status(res.status()).with_url(token_endpoint.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnyRedirect;
    use crate::keystore::Keystore;
    use http::Response as HttpResponse;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockClient {
        queue: Arc<Mutex<VecDeque<HttpResponse<Vec<u8>>>>>,
        log: Arc<Mutex<Vec<http::Request<Vec<u8>>>>>,
    }

    impl MockClient {
        async fn push(&self, status: StatusCode, body: Value) {
            self.queue.lock().await.push_back(
                HttpResponse::builder()
                    .status(status)
                    .body(serde_json::to_vec(&body).unwrap())
                    .unwrap(),
            );
        }
    }

    impl HttpClient for MockClient {
        type Error = std::convert::Infallible;
        fn send_http(
            &self,
            request: http::Request<Vec<u8>>,
        ) -> impl core::future::Future<
            Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>,
        > + Send {
            let queue = self.queue.clone();
            let log = self.log.clone();
            async move {
                log.lock().await.push(request);
                Ok(queue.lock().await.pop_front().unwrap())
            }
        }
    }

    fn config(environment: &str) -> MyInfoConfig {
        let raw = json!({
            "client_id": "client1",
            "client_secret": "secret1",
            "myinfo_attributes": "name,dob",
            "environment": environment,
            "authorization_scope": "name dob",
            "redirect_uri": "http://127.0.0.1:3001/callback",
            "authorization_endpoint_uri": "https://auth.example.com/authorise",
            "token_endpoint_uri": "https://auth.example.com/token",
            "private_key_password": "12345678"
        });
        MyInfoConfig::from_slice(&serde_json::to_vec(&raw).unwrap(), &AnyRedirect).unwrap()
    }

    fn form(req: &http::Request<Vec<u8>>) -> BTreeMap<String, String> {
        serde_html_form::from_bytes(req.body()).unwrap()
    }

    #[tokio::test]
    async fn sandbox_posts_client_secret() {
        let client = MockClient::default();
        client
            .push(
                StatusCode::OK,
                json!({"access_token": "tok", "token_type": "Bearer", "expires_in": 1800}),
            )
            .await;
        let token = exchange_code(&client, &config("sandbox"), "code1").await.unwrap();
        assert_eq!(token.access_token.as_deref(), Some("tok"));
        assert!(token.access_token_expires_at.is_some());

        let log = client.log.lock().await;
        let req = &log[0];
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), "https://auth.example.com/token");
        assert!(req.headers().get(http::header::AUTHORIZATION).is_none());
        let body = form(req);
        assert_eq!(body["grant_type"], "authorization_code");
        assert_eq!(body["code"], "code1");
        assert_eq!(body["redirect_uri"], "http://127.0.0.1:3001/callback");
        assert_eq!(body["client_id"], "client1");
        assert_eq!(body["client_secret"], "secret1");
    }

    #[tokio::test]
    async fn test_environment_signs_token_request() {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let config = config("test").with_keystore(Keystore::from_private_key(key).unwrap());
        let client = MockClient::default();
        client
            .push(StatusCode::OK, json!({"access_token": "tok", "token_type": "Bearer"}))
            .await;
        exchange_code(&client, &config, "code1").await.unwrap();

        let log = client.log.lock().await;
        let header = log[0]
            .headers()
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(header.starts_with("PKI_SIGN app_id=\"client1\",timestamp=\""));
        assert!(header.contains(",signature_method=\"RS256\",signature=\""));
        assert_eq!(form(&log[0])["client_secret"], "secret1");
    }

    #[tokio::test]
    async fn test_environment_without_keystore_fails() {
        let err = exchange_code(&MockClient::default(), &config("test"), "code1")
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), RequestErrorKind::Signing));
    }

    #[tokio::test]
    async fn oauth_error_body_becomes_token_error() {
        let client = MockClient::default();
        client
            .push(
                StatusCode::BAD_REQUEST,
                json!({"error": "invalid_grant", "error_description": "code expired"}),
            )
            .await;
        let err = exchange_code(&client, &config("sandbox"), "code1").await.unwrap_err();
        assert!(matches!(
            err.kind(),
            RequestErrorKind::HttpStatusWithBody { status, .. } if *status == StatusCode::BAD_REQUEST
        ));
        let auth_err = err.to_authorization_error();
        assert_eq!(auth_err.kind, AuthorizationErrorKind::Token);
        assert_eq!(auth_err.to_string(), "invalid_grant: code expired");
    }

    #[tokio::test]
    async fn server_error_is_general() {
        let client = MockClient::default();
        client.push(StatusCode::BAD_GATEWAY, json!(null)).await;
        let err = exchange_code(&client, &config("sandbox"), "code1").await.unwrap_err();
        assert!(matches!(err.kind(), RequestErrorKind::HttpStatus(_)));
        assert_eq!(
            err.to_authorization_error().kind,
            AuthorizationErrorKind::General
        );
    }

    #[tokio::test]
    async fn refresh_requires_token() {
        let err = refresh(&MockClient::default(), &config("sandbox"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), RequestErrorKind::NoRefreshToken));
    }

    #[tokio::test]
    async fn refresh_sends_grant() {
        let client = MockClient::default();
        client
            .push(
                StatusCode::OK,
                json!({"access_token": "new", "token_type": "Bearer", "refresh_token": "r2"}),
            )
            .await;
        let token = refresh(&client, &config("sandbox"), Some("r1"), Some("name dob"))
            .await
            .unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("r2"));
        let log = client.log.lock().await;
        let body = form(&log[0]);
        assert_eq!(body["grant_type"], "refresh_token");
        assert_eq!(body["refresh_token"], "r1");
        assert_eq!(body["scope"], "name dob");
    }
}
