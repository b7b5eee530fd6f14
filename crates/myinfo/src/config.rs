//! Loading and validation of the bundled client configuration.
//!
//! The configuration lives in a directory next to the application as
//! `myinfo_config.json`, with the client's PKCS#12 keystore alongside it as
//! `myinfo_certificate.p12`. Everything is validated once at load time and
//! is immutable afterwards.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use url::Url;

use crate::keystore::{Keystore, KeystoreError};

pub const CONFIG_FILE_NAME: &str = "myinfo_config.json";
pub const KEYSTORE_FILE_NAME: &str = "myinfo_certificate.p12";
pub const DEFAULT_PURPOSE: &str = "demo of myinfo";

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Invalid or unreadable configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(
    code(myinfo::config),
    help("fix myinfo_config.json and restart; the configuration is only read once")
)]
pub struct ConfigError {
    message: SmolStr,
    #[source]
    source: Option<BoxError>,
}

impl ConfigError {
    pub fn new(message: impl Into<SmolStr>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<KeystoreError> for ConfigError {
    fn from(e: KeystoreError) -> Self {
        let message = smol_str::format_smolstr!("Failed to load keystore: {e}");
        Self::new(message).with_source(e)
    }
}

/// MyInfo deployment the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    Test,
    Production,
}

impl Environment {
    pub fn slug(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }

    /// Base URL of the person API for this environment.
    pub fn host(&self) -> &'static str {
        match self {
            Environment::Sandbox => "https://sandbox.api.myinfo.gov.sg/com/v3/",
            Environment::Test => "https://test.api.myinfo.gov.sg/com/v3/",
            Environment::Production => "https://api.myinfo.gov.sg/com/v3/",
        }
    }

    /// Whether requests are PKI signed and responses encrypted.
    pub fn requires_pki(&self) -> bool {
        !matches!(self, Environment::Sandbox)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(Environment::Sandbox),
            "test" => Ok(Environment::Test),
            "production" => Ok(Environment::Production),
            _ => Err(ConfigError::new(
                "environment must be one of sandbox, test, or production",
            )),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Decides whether the application can receive the authorization redirect.
pub trait RedirectPolicy {
    fn handles(&self, uri: &Url) -> bool;
}

impl<F> RedirectPolicy for F
where
    F: Fn(&Url) -> bool,
{
    fn handles(&self, uri: &Url) -> bool {
        self(uri)
    }
}

/// Accepts every redirect URI.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyRedirect;

impl RedirectPolicy for AnyRedirect {
    fn handles(&self, _uri: &Url) -> bool {
        true
    }
}

/// Accepts plain `http` redirects to the local machine, which the loopback
/// server can capture.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackRedirect;

impl RedirectPolicy for LoopbackRedirect {
    fn handles(&self, uri: &Url) -> bool {
        uri.scheme() == "http"
            && matches!(
                uri.host_str(),
                Some("127.0.0.1") | Some("localhost") | Some("[::1]")
            )
    }
}

/// Accepts redirects using a custom scheme registered by the application.
#[derive(Debug, Clone)]
pub struct SchemeRedirect(pub SmolStr);

impl RedirectPolicy for SchemeRedirect {
    fn handles(&self, uri: &Url) -> bool {
        uri.scheme() == self.0
    }
}

/// Validated client configuration.
#[derive(Clone)]
pub struct MyInfoConfig {
    pub client_id: SmolStr,
    pub client_secret: SmolStr,
    /// Comma separated person attributes, e.g. `name,dob,sex,nationality`.
    pub attributes: SmolStr,
    pub scope: SmolStr,
    pub redirect_uri: Url,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub environment: Environment,
    pub private_key_password: Option<SmolStr>,
    pub purpose: SmolStr,
    hash: SmolStr,
    keystore: Option<Arc<Keystore>>,
}

impl fmt::Debug for MyInfoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MyInfoConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("attributes", &self.attributes)
            .field("scope", &self.scope)
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("authorization_endpoint", &self.authorization_endpoint.as_str())
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("environment", &self.environment)
            .field("purpose", &self.purpose)
            .field("hash", &self.hash)
            .field("keystore", &self.keystore.is_some())
            .finish()
    }
}

impl MyInfoConfig {
    /// Load `myinfo_config.json` from `dir`, plus the keystore when the
    /// environment signs its requests.
    pub fn load(dir: impl AsRef<Path>, policy: &impl RedirectPolicy) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let bytes = std::fs::read(dir.join(CONFIG_FILE_NAME)).map_err(|e| {
            ConfigError::new(smol_str::format_smolstr!(
                "Failed to read configuration: {e}"
            ))
            .with_source(e)
        })?;
        let mut config = Self::from_slice(&bytes, policy)?;
        let keystore_path = dir.join(KEYSTORE_FILE_NAME);
        if config.environment.requires_pki() {
            let password = config.private_key_password.clone().unwrap_or_default();
            config.keystore = Some(Arc::new(Keystore::open(&keystore_path, &password)?));
        } else if keystore_path.exists() {
            match &config.private_key_password {
                Some(password) => {
                    config.keystore = Some(Arc::new(Keystore::open(&keystore_path, password)?));
                }
                None => tracing::warn!(
                    path = %keystore_path.display(),
                    "ignoring keystore, no private_key_password configured"
                ),
            }
        }
        tracing::debug!(
            environment = %config.environment,
            keystore = config.keystore.is_some(),
            "loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate raw configuration bytes. No keystore is attached;
    /// see [`MyInfoConfig::with_keystore`].
    pub fn from_slice(bytes: &[u8], policy: &impl RedirectPolicy) -> Result<Self, ConfigError> {
        let hash = STANDARD.encode(Sha256::digest(bytes));
        let json: Value = serde_json::from_slice(bytes).map_err(|e| {
            ConfigError::new(smol_str::format_smolstr!(
                "Unable to parse configuration: {e}"
            ))
            .with_source(e)
        })?;
        let Value::Object(json) = json else {
            return Err(ConfigError::new(
                "Unable to parse configuration: expected a JSON object",
            ));
        };
        let json = ConfigJson(json);

        let client_id = json
            .string("client_id")
            .ok_or_else(|| ConfigError::new("client_id is empty"))?;
        let client_secret = json
            .string("client_secret")
            .ok_or_else(|| ConfigError::new("client_secret is empty"))?;
        let attributes = json
            .string("myinfo_attributes")
            .ok_or_else(|| ConfigError::new("myinfo_attributes is empty"))?;
        let environment: Environment = json
            .string("environment")
            .unwrap_or_default()
            .parse()?;

        let scope = json.required_string("authorization_scope")?;
        let redirect_uri = json.required_uri("redirect_uri")?;
        if !policy.handles(&redirect_uri) {
            return Err(ConfigError::new(smol_str::format_smolstr!(
                "redirect_uri is not handled by this application! \
                 Ensure the redirect target {redirect_uri} is registered with the application \
                 or served by its loopback listener."
            )));
        }
        let authorization_endpoint = json.required_web_uri("authorization_endpoint_uri")?;
        let token_endpoint = json.required_web_uri("token_endpoint_uri")?;

        let private_key_password = json.string("private_key_password");
        if environment.requires_pki() && private_key_password.is_none() {
            return Err(ConfigError::new(smol_str::format_smolstr!(
                "private_key_password is required for the {environment} environment"
            )));
        }
        let purpose = json
            .string("purpose")
            .unwrap_or_else(|| SmolStr::new_static(DEFAULT_PURPOSE));

        Ok(Self {
            client_id,
            client_secret,
            attributes,
            scope,
            redirect_uri,
            authorization_endpoint,
            token_endpoint,
            environment,
            private_key_password,
            purpose,
            hash: hash.into(),
            keystore: None,
        })
    }

    pub fn with_keystore(mut self, keystore: Keystore) -> Self {
        self.keystore = Some(Arc::new(keystore));
        self
    }

    pub fn keystore(&self) -> Option<&Keystore> {
        self.keystore.as_deref()
    }

    /// SHA-256 of the raw configuration bytes, standard base64.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn host(&self) -> &'static str {
        self.environment.host()
    }

    /// Request details may be logged outside production.
    pub fn debug_log(&self) -> bool {
        self.environment != Environment::Production
    }
}

struct ConfigJson(Map<String, Value>);

impl ConfigJson {
    /// Trimmed, non-empty value of `key`.
    fn string(&self, key: &str) -> Option<SmolStr> {
        let value = match self.0.get(key)? {
            Value::Null => return None,
            Value::String(s) => SmolStr::new(s.trim()),
            other => smol_str::format_smolstr!("{other}"),
        };
        (!value.is_empty()).then_some(value)
    }

    fn required_string(&self, key: &str) -> Result<SmolStr, ConfigError> {
        self.string(key).ok_or_else(|| {
            ConfigError::new(smol_str::format_smolstr!(
                "{key} is required but not specified in the configuration"
            ))
        })
    }

    fn required_uri(&self, key: &str) -> Result<Url, ConfigError> {
        let raw = self.required_string(key)?;
        let uri = Url::parse(&raw).map_err(|e| {
            ConfigError::new(smol_str::format_smolstr!("{key} could not be parsed")).with_source(e)
        })?;
        if uri.cannot_be_a_base() {
            return Err(ConfigError::new(smol_str::format_smolstr!(
                "{key} must be hierarchical and absolute"
            )));
        }
        if !uri.username().is_empty() || uri.password().is_some() {
            return Err(ConfigError::new(smol_str::format_smolstr!(
                "{key} must not have user info"
            )));
        }
        if uri.query().is_some_and(|q| !q.is_empty()) {
            return Err(ConfigError::new(smol_str::format_smolstr!(
                "{key} must not have query parameters"
            )));
        }
        if uri.fragment().is_some_and(|f| !f.is_empty()) {
            return Err(ConfigError::new(smol_str::format_smolstr!(
                "{key} must not have a fragment"
            )));
        }
        Ok(uri)
    }

    fn required_web_uri(&self, key: &str) -> Result<Url, ConfigError> {
        let uri = self.required_uri(key)?;
        if !matches!(uri.scheme(), "http" | "https") {
            return Err(ConfigError::new(smol_str::format_smolstr!(
                "{key} must have an http or https scheme"
            )));
        }
        Ok(uri)
    }
}
