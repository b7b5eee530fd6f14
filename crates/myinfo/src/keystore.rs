use std::path::Path;

use miette::Diagnostic;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{Id, PKey, Private};
use openssl::x509::X509;
use thiserror::Error;

/// Errors from opening the client's PKCS#12 keystore.
#[derive(Debug, Error, Diagnostic)]
pub enum KeystoreError {
    /// Keystore file could not be read
    #[error("failed to read keystore: {0}")]
    #[diagnostic(code(myinfo::keystore::io))]
    Io(#[from] std::io::Error),
    /// Keystore could not be decoded or the password is wrong
    #[error("failed to open keystore: {0}")]
    #[diagnostic(
        code(myinfo::keystore::pkcs12),
        help("check `private_key_password` in the configuration matches the keystore")
    )]
    Pkcs12(#[from] openssl::error::ErrorStack),
    /// Keystore holds no private key
    #[error("keystore does not contain a private key")]
    #[diagnostic(code(myinfo::keystore::missing_key))]
    MissingKey,
    /// Private key is not an RSA key
    #[error("keystore private key is not an RSA key")]
    #[diagnostic(
        code(myinfo::keystore::not_rsa),
        help("MyInfo signs with RS256 and encrypts with RSA-OAEP; export an RSA key pair")
    )]
    NotRsa,
}

/// The client's RSA key pair, used for request signing and response
/// decryption.
#[derive(Clone)]
pub struct Keystore {
    key: PKey<Private>,
    certificate: Option<X509>,
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore")
            .field("key", &"<redacted>")
            .field("has_certificate", &self.certificate.is_some())
            .finish()
    }
}

impl Keystore {
    /// Read a PKCS#12 file protected by `password`.
    pub fn open(path: impl AsRef<Path>, password: &str) -> Result<Self, KeystoreError> {
        let der = std::fs::read(path)?;
        Self::from_pkcs12_der(&der, password)
    }

    /// Decode a DER encoded PKCS#12 archive.
    pub fn from_pkcs12_der(der: &[u8], password: &str) -> Result<Self, KeystoreError> {
        let parsed = Pkcs12::from_der(der)?.parse2(password)?;
        let key = parsed.pkey.ok_or(KeystoreError::MissingKey)?;
        let mut keystore = Self::from_private_key(key)?;
        keystore.certificate = parsed.cert;
        Ok(keystore)
    }

    /// Wrap an already loaded private key.
    pub fn from_private_key(key: PKey<Private>) -> Result<Self, KeystoreError> {
        if key.id() != Id::RSA {
            return Err(KeystoreError::NotRsa);
        }
        Ok(Self {
            key,
            certificate: None,
        })
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.key
    }

    pub fn certificate(&self) -> Option<&X509> {
        self.certificate.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;

    #[test]
    fn rejects_non_rsa_keys() {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        assert!(matches!(
            Keystore::from_private_key(key),
            Err(KeystoreError::NotRsa)
        ));
    }

    #[test]
    fn garbage_archive_is_a_pkcs12_error() {
        assert!(matches!(
            Keystore::from_pkcs12_der(b"not a keystore", "12345678"),
            Err(KeystoreError::Pkcs12(_))
        ));
    }

    #[test]
    fn debug_output_hides_key() {
        let key = PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap()).unwrap();
        let keystore = Keystore::from_private_key(key).unwrap();
        let debug = format!("{keystore:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("BEGIN"));
    }
}
