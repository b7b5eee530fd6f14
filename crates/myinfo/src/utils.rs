use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rand::{CryptoRng, RngCore, rngs::ThreadRng};
use smol_str::SmolStr;

/// Random hex nonce for `PKI_SIGN` headers, 32 characters.
pub fn generate_nonce() -> SmolStr {
    hex::encode(get_random_values::<_, 16>(&mut ThreadRng::default())).into()
}

/// Opaque value for the OAuth `state` parameter.
pub fn generate_state() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 16>(&mut ThreadRng::default()))
        .into()
}

pub fn get_random_values<R, const LEN: usize>(rng: &mut R) -> [u8; LEN]
where
    R: RngCore + CryptoRng,
{
    let mut bytes = [0u8; LEN];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Current time in milliseconds since the epoch.
pub fn timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}
