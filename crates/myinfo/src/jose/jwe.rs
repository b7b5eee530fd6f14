use josekit::jwe::{RSA_OAEP, RSA_OAEP_256};
use openssl::pkey::{PKey, Private};
use serde::Deserialize;

use super::{JoseError, decode_segment, split_compact};

#[derive(Deserialize)]
struct ProtectedHeader {
    alg: Option<String>,
    enc: Option<String>,
}

/// Decrypt a compact JWE addressed to `key`.
///
/// Key management is RSA-OAEP (or RSA-OAEP-256 when the header says so);
/// content encryption is whatever the header names, typically `A256GCM` or
/// `A256CBC-HS512`.
pub fn decrypt(token: &str, key: &PKey<Private>) -> Result<Vec<u8>, JoseError> {
    let token = token.trim().trim_matches('"');
    let [header, ..] = split_compact::<5>(token)?;
    let header: ProtectedHeader = serde_json::from_slice(&decode_segment(header)?)?;

    let pem = key.private_key_to_pem_pkcs8()?;
    let decrypter = match header.alg.as_deref() {
        Some("RSA-OAEP-256") => RSA_OAEP_256.decrypter_from_pem(&pem)?,
        _ => RSA_OAEP.decrypter_from_pem(&pem)?,
    };
    let (payload, _) = josekit::jwe::deserialize_compact(token, &decrypter)?;
    tracing::trace!(alg = ?header.alg, enc = ?header.enc, "decrypted JWE");
    Ok(payload)
}
