use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use http::{Method, Response as HttpResponse, StatusCode};
use josekit::jwe::{JweHeader, RSA_OAEP};
use josekit::jws::{JwsHeader, RS256};
use myinfo::MyInfoClient;
use myinfo::config::{
    CONFIG_FILE_NAME, Environment, KEYSTORE_FILE_NAME, LoopbackRedirect, MyInfoConfig,
};
use myinfo::error::MyInfoError;
use myinfo::signing::{AuthParams, base_string};
use myinfo_common::http_client::HttpClient;
use myinfo_common::store::MemoryStore;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::Verifier;
use openssl::x509::{X509, X509NameBuilder};
use serde_json::json;
use smol_str::SmolStr;
use url::Url;

#[derive(Clone, Default)]
struct MockClient {
    queue: Arc<tokio::sync::Mutex<VecDeque<http::Response<Vec<u8>>>>>,
    log: Arc<tokio::sync::Mutex<Vec<http::Request<Vec<u8>>>>>,
}

impl MockClient {
    async fn push(&self, status: StatusCode, body: Vec<u8>) {
        self.queue.lock().await.push_back(
            HttpResponse::builder()
                .status(status)
                .body(body)
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
            Ok(queue.lock().await.pop_front().expect("no queued response"))
        }
    }
}

const PASSWORD: &str = "12345678";
const PERSON: &str = r#"{"name":{"lastupdated":"2020-10-01","source":"1","classification":"C","value":"MY.INFO:CC"},"nationality":{"lastupdated":"2020-10-01","code":"IN","source":"1","classification":"C","desc":"INDIAN"}}"#;

fn rsa_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

fn public(key: &PKey<Private>) -> PKey<Public> {
    PKey::public_key_from_pem(&key.public_key_to_pem().unwrap()).unwrap()
}

fn self_signed(key: &PKey<Private>) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "myinfo-client").unwrap();
    let name = name.build();
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

fn bundle_config(environment: &str, key_password: Option<&str>) -> serde_json::Value {
    let host = match environment {
        "production" => "api.myinfo.gov.sg".to_owned(),
        other => format!("{other}.api.myinfo.gov.sg"),
    };
    let mut config = json!({
        "client_id": "STG-T18CS0001E-MYINFO",
        "client_secret": "client-secret",
        "myinfo_attributes": "name,nationality",
        "environment": environment,
        "authorization_scope": "name nationality",
        "redirect_uri": "http://127.0.0.1:3001/callback",
        "authorization_endpoint_uri": format!("https://{host}/com/v3/authorise"),
        "token_endpoint_uri": format!("https://{host}/com/v3/token"),
    });
    if let Some(key_password) = key_password {
        config["private_key_password"] = json!(key_password);
    }
    config
}

fn write_keystore(dir: &Path, key: &PKey<Private>, password: &str) {
    let cert = self_signed(key);
    let p12 = Pkcs12::builder()
        .name("myinfo")
        .pkey(key)
        .cert(&cert)
        .build2(password)
        .unwrap();
    std::fs::write(dir.join(KEYSTORE_FILE_NAME), p12.to_der().unwrap()).unwrap();
}

fn write_config(dir: &Path, config: &serde_json::Value) {
    std::fs::write(dir.join(CONFIG_FILE_NAME), serde_json::to_vec(config).unwrap()).unwrap();
}

fn write_bundle(dir: &Path, key: &PKey<Private>, password: &str) {
    write_config(dir, &bundle_config("test", Some(PASSWORD)));
    write_keystore(dir, key, password);
}

fn state_of(url: &Url) -> String {
    url.query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

fn access_token(sub: &str) -> String {
    format!(
        "{}.{}.c2ln",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&json!({"sub": sub})).unwrap())
    )
}

/// Person payload the way MyInfo sends it: signed by MyInfo, then encrypted
/// to the client's public key.
fn encrypted_person(myinfo_key: &PKey<Private>, client_key: &PKey<Private>) -> String {
    let signer = RS256
        .signer_from_pem(myinfo_key.private_key_to_pem_pkcs8().unwrap())
        .unwrap();
    let jws = josekit::jws::serialize_compact(PERSON.as_bytes(), &JwsHeader::new(), &signer)
        .unwrap();
    let encrypter = RSA_OAEP
        .encrypter_from_pem(client_key.public_key_to_pem().unwrap())
        .unwrap();
    let mut header = JweHeader::new();
    header.set_content_encryption("A256GCM");
    josekit::jwe::serialize_compact(jws.as_bytes(), &header, &encrypter).unwrap()
}

/// Parse `PKI_SIGN k="v",...` into its fields and the trailing bearer token.
fn parse_pki_header(header: &str) -> (HashMap<String, String>, Option<String>) {
    let rest = header.strip_prefix("PKI_SIGN ").unwrap();
    let (fields, bearer) = match rest.split_once(",Bearer ") {
        Some((fields, bearer)) => (fields, Some(bearer.to_owned())),
        None => (rest, None),
    };
    let fields = fields
        .split(',')
        .map(|kv| {
            let (k, v) = kv.split_once('=').unwrap();
            (k.to_owned(), v.trim_matches('"').to_owned())
        })
        .collect();
    (fields, bearer)
}

fn verify(
    key: &PKey<Private>,
    method: &Method,
    url: &Url,
    params: BTreeMap<SmolStr, SmolStr>,
    fields: &HashMap<String, String>,
) -> bool {
    let auth = AuthParams {
        app_id: fields["app_id"].as_str().into(),
        nonce: fields["nonce"].as_str().into(),
        timestamp: fields["timestamp"].parse().unwrap(),
    };
    let base = base_string(method, url, &params, &auth);
    let mut verifier = Verifier::new(MessageDigest::sha256(), key).unwrap();
    verifier.update(base.as_bytes()).unwrap();
    verifier
        .verify(&STANDARD.decode(&fields["signature"]).unwrap())
        .unwrap()
}

#[tokio::test]
async fn signed_login_and_encrypted_person() {
    let dir = tempfile::tempdir().unwrap();
    let client_key = rsa_key();
    let myinfo_key = rsa_key();
    write_bundle(dir.path(), &client_key, PASSWORD);

    let config = MyInfoConfig::load(dir.path(), &LoopbackRedirect).unwrap();
    assert_eq!(config.environment, Environment::Test);
    assert!(config.keystore().unwrap().certificate().is_some());

    let http = MockClient::default();
    let client = MyInfoClient::new(config, MemoryStore::new(), http.clone())
        .await
        .unwrap()
        .with_verification_key(public(&myinfo_key));

    let auth_url = client.authorization_url().await.unwrap();
    let state = state_of(&auth_url);
    let token = access_token("S9812381D");
    http.push(
        StatusCode::OK,
        serde_json::to_vec(&json!({"access_token": token, "token_type": "Bearer", "expires_in": 1799}))
            .unwrap(),
    )
    .await;
    let redirect =
        Url::parse(&format!("http://127.0.0.1:3001/callback?code=the-code&state={state}")).unwrap();
    assert_eq!(client.on_post_login_url(&redirect).await.unwrap(), token);

    http.push(
        StatusCode::OK,
        encrypted_person(&myinfo_key, &client_key).into_bytes(),
    )
    .await;
    let person = client.get_person().await.unwrap();
    assert_eq!(person.name().unwrap().value_str(), Some("MY.INFO:CC"));
    assert_eq!(person.nationality().unwrap().code.as_deref(), Some("IN"));

    let log = http.log.lock().await;

    // token request: signed over the form parameters
    let token_req = &log[0];
    let header = token_req.headers()[http::header::AUTHORIZATION].to_str().unwrap();
    let (fields, bearer) = parse_pki_header(header);
    assert_eq!(bearer, None);
    assert_eq!(fields["app_id"], "STG-T18CS0001E-MYINFO");
    assert_eq!(fields["signature_method"], "RS256");
    let form: BTreeMap<SmolStr, SmolStr> = serde_html_form::from_bytes(token_req.body()).unwrap();
    let token_url = Url::parse("https://test.api.myinfo.gov.sg/com/v3/token").unwrap();
    assert!(verify(&client_key, &Method::POST, &token_url, form, &fields));

    // person request: signed over the query, bearer token appended
    let person_req = &log[1];
    let header = person_req.headers()[http::header::AUTHORIZATION].to_str().unwrap();
    let (fields, bearer) = parse_pki_header(header);
    assert_eq!(bearer.as_deref(), Some(token.as_str()));
    let url = Url::parse(&person_req.uri().to_string()).unwrap();
    assert_eq!(url.path(), "/com/v3/person/S9812381D/");
    let query: BTreeMap<SmolStr, SmolStr> = url
        .query_pairs()
        .map(|(k, v)| (k.as_ref().into(), v.as_ref().into()))
        .collect();
    assert_eq!(query["attributes"], "name,nationality");
    assert!(verify(&client_key, &Method::GET, &url, query, &fields));
}

#[tokio::test]
async fn forged_person_signature_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let client_key = rsa_key();
    write_bundle(dir.path(), &client_key, PASSWORD);
    let config = MyInfoConfig::load(dir.path(), &LoopbackRedirect).unwrap();

    let http = MockClient::default();
    let client = MyInfoClient::new(config, MemoryStore::new(), http.clone())
        .await
        .unwrap()
        .with_verification_key(public(&rsa_key()));
    let state = state_of(&client.authorization_url().await.unwrap());
    http.push(
        StatusCode::OK,
        serde_json::to_vec(&json!({"access_token": access_token("S1"), "token_type": "Bearer"}))
            .unwrap(),
    )
    .await;
    let redirect =
        Url::parse(&format!("http://127.0.0.1:3001/callback?code=c&state={state}")).unwrap();
    client.on_post_login_url(&redirect).await.unwrap();

    // signed by someone other than the configured MyInfo key
    http.push(StatusCode::OK, encrypted_person(&rsa_key(), &client_key).into_bytes())
        .await;
    let err = client.get_person().await.unwrap_err();
    assert!(matches!(err, MyInfoError::Payload(_)));
}

#[tokio::test]
async fn wrong_keystore_password() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(dir.path(), &rsa_key(), "not-the-password");
    let err = MyInfoConfig::load(dir.path(), &LoopbackRedirect).unwrap_err();
    assert!(err.message().starts_with("Failed to load keystore"));
}

#[tokio::test]
async fn missing_keystore() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(dir.path(), &rsa_key(), PASSWORD);
    std::fs::remove_file(dir.path().join(KEYSTORE_FILE_NAME)).unwrap();
    let err = MyInfoConfig::load(dir.path(), &LoopbackRedirect).unwrap_err();
    assert!(err.message().starts_with("Failed to load keystore"));
}

#[tokio::test]
async fn production_signs_against_the_production_host() {
    let dir = tempfile::tempdir().unwrap();
    let client_key = rsa_key();
    let myinfo_key = rsa_key();
    write_config(dir.path(), &bundle_config("production", Some(PASSWORD)));
    write_keystore(dir.path(), &client_key, PASSWORD);

    let config = MyInfoConfig::load(dir.path(), &LoopbackRedirect).unwrap();
    assert_eq!(config.environment, Environment::Production);
    assert!(!config.debug_log());
    assert_eq!(config.host(), "https://api.myinfo.gov.sg/com/v3/");

    let http = MockClient::default();
    let client = MyInfoClient::new(config, MemoryStore::new(), http.clone())
        .await
        .unwrap()
        .with_verification_key(public(&myinfo_key));
    let state = state_of(&client.authorization_url().await.unwrap());
    let token = access_token("S9812381D");
    http.push(
        StatusCode::OK,
        serde_json::to_vec(&json!({"access_token": token, "token_type": "Bearer"})).unwrap(),
    )
    .await;
    let redirect =
        Url::parse(&format!("http://127.0.0.1:3001/callback?code=c&state={state}")).unwrap();
    client.on_post_login_url(&redirect).await.unwrap();

    http.push(
        StatusCode::OK,
        encrypted_person(&myinfo_key, &client_key).into_bytes(),
    )
    .await;
    client.get_person().await.unwrap();

    let log = http.log.lock().await;
    let token_req = &log[0];
    assert_eq!(token_req.uri().to_string(), "https://api.myinfo.gov.sg/com/v3/token");
    let header = token_req.headers()[http::header::AUTHORIZATION].to_str().unwrap();
    let (fields, _) = parse_pki_header(header);
    let form: BTreeMap<SmolStr, SmolStr> = serde_html_form::from_bytes(token_req.body()).unwrap();
    let token_url = Url::parse("https://api.myinfo.gov.sg/com/v3/token").unwrap();
    assert!(verify(&client_key, &Method::POST, &token_url, form, &fields));

    let person_req = &log[1];
    let url = Url::parse(&person_req.uri().to_string()).unwrap();
    assert_eq!(url.host_str(), Some("api.myinfo.gov.sg"));
    assert_eq!(url.path(), "/com/v3/person/S9812381D/");
    let header = person_req.headers()[http::header::AUTHORIZATION].to_str().unwrap();
    let (fields, bearer) = parse_pki_header(header);
    assert_eq!(bearer.as_deref(), Some(token.as_str()));
    let query: BTreeMap<SmolStr, SmolStr> = url
        .query_pairs()
        .map(|(k, v)| (k.as_ref().into(), v.as_ref().into()))
        .collect();
    assert!(verify(&client_key, &Method::GET, &url, query, &fields));
}

#[tokio::test]
async fn sandbox_loads_keystore_when_present() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), &bundle_config("sandbox", Some(PASSWORD)));
    let config = MyInfoConfig::load(dir.path(), &LoopbackRedirect).unwrap();
    assert!(config.keystore().is_none());
    assert!(config.debug_log());

    write_keystore(dir.path(), &rsa_key(), PASSWORD);
    let config = MyInfoConfig::load(dir.path(), &LoopbackRedirect).unwrap();
    assert_eq!(config.environment, Environment::Sandbox);
    assert!(config.keystore().unwrap().certificate().is_some());
}

#[tokio::test]
async fn sandbox_ignores_keystore_without_password() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), &bundle_config("sandbox", None));
    write_keystore(dir.path(), &rsa_key(), PASSWORD);
    let config = MyInfoConfig::load(dir.path(), &LoopbackRedirect).unwrap();
    assert!(config.keystore().is_none());
}
