//! MyInfo (Singpass) OAuth client.
//!
//! Drives the authorization-code flow against the MyInfo authorization
//! server, keeps the resulting [`state::AuthState`] persisted through a
//! [`myinfo_common::KeyValueStore`], and fetches person data. Test and
//! production environments sign every request with the client's RSA key
//! (`PKI_SIGN`) and receive the person payload as an encrypted JWE, which is
//! decrypted with the same key.
//!
//! The entry point is [`client::MyInfoClient`].

pub mod authstate;
pub mod client;
pub mod config;
pub mod error;
pub mod jose;
pub mod keystore;
pub mod person;
pub mod request;
pub mod signing;
pub mod state;
pub mod storage;
pub mod types;
pub mod utils;

#[cfg(feature = "loopback")]
pub mod loopback;

pub use client::MyInfoClient;
pub use config::{Environment, MyInfoConfig};
pub use error::{MyInfoError, Result};
pub use person::{Person, PersonAttribute};

/// `authmode` sent with every authorization request.
pub const AUTH_MODE: &str = "SINGPASS";
