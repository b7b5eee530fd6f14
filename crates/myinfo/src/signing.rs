//! `PKI_SIGN` request signing.
//!
//! Test and production requests carry an `Authorization` header of the form
//!
//! ```text
//! PKI_SIGN app_id="..",timestamp="..",nonce="..",signature_method="RS256",signature=".."
//! ```
//!
//! where the signature is SHA256withRSA over a base string made of the HTTP
//! method, the URL without its query, and every request parameter (including
//! the auth parameters) sorted by name.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::Method;
use miette::Diagnostic;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use smol_str::{SmolStr, format_smolstr};
use thiserror::Error;
use url::Url;

use crate::utils::{generate_nonce, timestamp_millis};

pub const SIGNATURE_METHOD: &str = "RS256";
pub const AUTH_SCHEME: &str = "PKI_SIGN";

#[derive(Debug, Error, Diagnostic)]
pub enum SigningError {
    #[error("failed to sign request: {0}")]
    #[diagnostic(
        code(myinfo::signing::openssl),
        help("the keystore must hold a usable RSA private key")
    )]
    Openssl(#[from] openssl::error::ErrorStack),
    #[error("no private key loaded; test and production require myinfo_certificate.p12")]
    #[diagnostic(code(myinfo::signing::no_key))]
    NoKey,
}

/// Per-request authentication parameters mixed into the base string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthParams {
    pub app_id: SmolStr,
    pub nonce: SmolStr,
    pub timestamp: i64,
}

impl AuthParams {
    /// Fresh nonce and current timestamp.
    pub fn new(app_id: impl Into<SmolStr>) -> Self {
        Self {
            app_id: app_id.into(),
            nonce: generate_nonce(),
            timestamp: timestamp_millis(),
        }
    }
}

/// `METHOD&URL&k1=v1&k2=v2...` with `params` and the auth parameters sorted
/// by key. Query and fragment of `url` are ignored; pass query parameters in
/// `params` instead.
pub fn base_string(
    method: &Method,
    url: &Url,
    params: &BTreeMap<SmolStr, SmolStr>,
    auth: &AuthParams,
) -> String {
    let mut all = params.clone();
    all.insert("app_id".into(), auth.app_id.clone());
    all.insert("nonce".into(), auth.nonce.clone());
    all.insert("signature_method".into(), SIGNATURE_METHOD.into());
    all.insert("timestamp".into(), format_smolstr!("{}", auth.timestamp));

    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);

    let mut out = format!("{}&{}", method.as_str(), url);
    for (k, v) in &all {
        out.push('&');
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

/// SHA256withRSA signature of `data`, standard base64.
pub fn sign(key: &PKey<Private>, data: &[u8]) -> Result<SmolStr, SigningError> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(data)?;
    Ok(STANDARD.encode(signer.sign_to_vec()?).into())
}

pub fn pki_sign_header(auth: &AuthParams, signature: &str) -> SmolStr {
    format_smolstr!(
        "{AUTH_SCHEME} app_id=\"{}\",timestamp=\"{}\",nonce=\"{}\",signature_method=\"{SIGNATURE_METHOD}\",signature=\"{}\"",
        auth.app_id,
        auth.timestamp,
        auth.nonce,
        signature
    )
}

/// Append the bearer token to a `PKI_SIGN` header, as the person endpoint
/// expects.
pub fn with_bearer(header: &str, access_token: &str) -> SmolStr {
    format_smolstr!("{header},Bearer {access_token}")
}

/// Signs requests on behalf of one client.
#[derive(Clone, Copy)]
pub struct PkiSigner<'a> {
    key: &'a PKey<Private>,
    app_id: &'a str,
    debug_log: bool,
}

impl<'a> PkiSigner<'a> {
    pub fn new(key: &'a PKey<Private>, app_id: &'a str) -> Self {
        Self {
            key,
            app_id,
            debug_log: false,
        }
    }

    /// Log base strings at debug level. Never enable for production.
    pub fn debug_log(mut self, enabled: bool) -> Self {
        self.debug_log = enabled;
        self
    }

    /// Full `Authorization` header value for a request.
    pub fn authorization(
        &self,
        method: &Method,
        url: &Url,
        params: &BTreeMap<SmolStr, SmolStr>,
    ) -> Result<SmolStr, SigningError> {
        self.authorization_with(method, url, params, &AuthParams::new(self.app_id))
    }

    pub fn authorization_with(
        &self,
        method: &Method,
        url: &Url,
        params: &BTreeMap<SmolStr, SmolStr>,
        auth: &AuthParams,
    ) -> Result<SmolStr, SigningError> {
        let base = base_string(method, url, params, auth);
        if self.debug_log {
            tracing::debug!(base_string = %base, "signing request");
        }
        let signature = sign(self.key, base.as_bytes())?;
        Ok(pki_sign_header(auth, &signature))
    }
}
