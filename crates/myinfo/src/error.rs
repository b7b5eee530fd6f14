use http::StatusCode;
use miette::Diagnostic;
use myinfo_common::store::StoreError;
use smol_str::SmolStr;
use thiserror::Error;

use crate::config::ConfigError;
use crate::jose::JoseError;
use crate::request::{BoxError, RequestError};
use crate::signing::SigningError;
use crate::state::AuthorizationError;

/// Errors returned by [`crate::MyInfoClient`].
#[derive(Debug, Error, Diagnostic)]
pub enum MyInfoError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    /// Redirect arrived without any OAuth parameters
    #[error("callback carried no parameters")]
    #[diagnostic(code(myinfo::callback::empty))]
    EmptyCallback,

    /// Redirect query could not be decoded
    #[error("callback parameters could not be read: {0}")]
    #[diagnostic(code(myinfo::callback::parse))]
    CallbackParse(#[from] serde_html_form::de::Error),

    /// Authorization server redirected back with an `error`
    #[error("Authorization flow failed: {0}")]
    #[diagnostic(code(myinfo::callback::authorization))]
    AuthorizationFailed(AuthorizationError),

    /// `state` on the redirect is not the one we sent
    #[error("authorization response state does not match the request")]
    #[diagnostic(
        code(myinfo::callback::state_mismatch),
        help("start a new login; the redirect belongs to a different request")
    )]
    StateMismatch,

    /// Token endpoint rejected the authorization code
    #[error("Authorization Code exchange failed: {reason}")]
    #[diagnostic(code(myinfo::callback::code_exchange))]
    CodeExchange {
        reason: SmolStr,
        #[source]
        source: RequestError,
    },

    /// Redirect carried neither a code nor an error
    #[error("No authorization state retained - reauthorization required")]
    #[diagnostic(code(myinfo::callback::no_state))]
    NoAuthorizationState,

    #[error("Access token not found")]
    #[diagnostic(code(myinfo::person::no_token), help("log in first"))]
    AccessTokenNotFound,

    /// Access token has no `sub` claim, or is not a JWT at all
    #[error("Invalid access token, no claim found")]
    #[diagnostic(code(myinfo::person::invalid_token))]
    InvalidAccessToken(#[source] Option<JoseError>),

    #[error("Empty response")]
    #[diagnostic(code(myinfo::person::empty))]
    EmptyResponse,

    /// Non-success status from the person API; the message is the response
    /// body
    #[error("{body}")]
    #[diagnostic(code(myinfo::person::status))]
    Server { status: StatusCode, body: SmolStr },

    /// Transport failure reaching the person API
    #[error("Fail on fetching person API")]
    #[diagnostic(
        code(myinfo::person::transport),
        help("check network connectivity to the MyInfo API host")
    )]
    Transport(#[source] BoxError),

    #[error("failed to open person payload: {0}")]
    #[diagnostic(code(myinfo::person::payload))]
    Payload(#[from] JoseError),

    #[error("person response is not valid JSON: {0}")]
    #[diagnostic(code(myinfo::person::json))]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    #[diagnostic(code(myinfo::request))]
    Request(#[from] RequestError),

    #[error("failed to build request: {0}")]
    #[diagnostic(code(myinfo::http_build))]
    HttpBuild(#[from] http::Error),

    #[cfg(feature = "loopback")]
    #[error(transparent)]
    #[diagnostic(transparent)]
    Loopback(#[from] crate::loopback::LoopbackError),

    #[error("invalid request URL: {0}")]
    #[diagnostic(code(myinfo::url))]
    Url(#[from] url::ParseError),
}

pub type Result<T> = core::result::Result<T, MyInfoError>;
