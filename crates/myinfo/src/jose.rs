pub mod jwe;
pub mod jws;
pub mod jwt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use miette::Diagnostic;
use openssl::pkey::{PKey, Private, Public};
use thiserror::Error;

/// Errors from decoding or decrypting JOSE objects.
#[derive(Debug, Error, Diagnostic)]
pub enum JoseError {
    /// Not a compact serialization with the expected number of parts
    #[error("malformed compact token: expected {expected} parts, found {found}")]
    #[diagnostic(code(myinfo::jose::malformed))]
    Malformed { expected: usize, found: usize },
    /// A part was not valid base64url
    #[error("invalid base64url segment: {0}")]
    #[diagnostic(code(myinfo::jose::base64))]
    Base64(#[from] base64::DecodeError),
    /// Claims or payload were not the expected JSON
    #[error("invalid JSON payload: {0}")]
    #[diagnostic(code(myinfo::jose::json))]
    Json(#[from] serde_json::Error),
    /// Decryption or signature verification failed
    #[error("{0}")]
    #[diagnostic(
        code(myinfo::jose::crypto),
        help("check the keystore matches the key registered with MyInfo")
    )]
    Crypto(#[from] josekit::JoseError),
    /// Key material could not be exported for the JOSE layer
    #[error("key export failed: {0}")]
    #[diagnostic(code(myinfo::jose::key))]
    Key(#[from] openssl::error::ErrorStack),
}

/// Split a compact serialization into exactly `N` dot separated parts.
pub(crate) fn split_compact<const N: usize>(token: &str) -> Result<[&str; N], JoseError> {
    let parts: Vec<&str> = token.trim().split('.').collect();
    <[&str; N]>::try_from(parts.as_slice()).map_err(|_| JoseError::Malformed {
        expected: N,
        found: parts.len(),
    })
}

/// Decode a base64url segment, tolerating trailing padding.
pub(crate) fn decode_segment(segment: &str) -> Result<Vec<u8>, JoseError> {
    Ok(URL_SAFE_NO_PAD.decode(segment.trim_end_matches('='))?)
}

/// Open an encrypted person response: decrypt the JWE with the client key,
/// then take the payload of the JWS inside it, verifying the signature when
/// `verify_with` is given.
pub fn open_person_payload(
    body: &str,
    key: &PKey<Private>,
    verify_with: Option<&PKey<Public>>,
) -> Result<Vec<u8>, JoseError> {
    let inner = jwe::decrypt(body, key)?;
    let inner = String::from_utf8_lossy(&inner);
    match verify_with {
        Some(public) => jws::verify_rs256(&inner, public),
        None => jws::payload_unverified(&inner),
    }
}
