use openssl::pkey::{PKey, Public};

use super::{JoseError, decode_segment, split_compact};

/// Payload of a compact JWS, without checking the signature.
pub fn payload_unverified(token: &str) -> Result<Vec<u8>, JoseError> {
    let [_, payload, _] = split_compact::<3>(unquote(token))?;
    decode_segment(payload)
}

/// Payload of a compact RS256 JWS after verifying it against `key`.
pub fn verify_rs256(token: &str, key: &PKey<Public>) -> Result<Vec<u8>, JoseError> {
    let pem = key.public_key_to_pem()?;
    let verifier = josekit::jws::RS256.verifier_from_pem(&pem)?;
    let (payload, _header) = josekit::jws::deserialize_compact(unquote(token), &verifier)?;
    Ok(payload)
}

// Decrypted MyInfo payloads are sometimes a JSON string literal.
fn unquote(token: &str) -> &str {
    let token = token.trim();
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token)
}
