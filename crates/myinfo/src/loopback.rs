#![cfg(feature = "loopback")]

use std::net::SocketAddr;
use std::time::Duration;

use miette::Diagnostic;
use myinfo_common::http_client::HttpClient;
use rouille::Server;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::client::MyInfoClient;
use crate::config::{LoopbackRedirect, RedirectPolicy};
use crate::error::Result;
use crate::request::BoxError;
use crate::storage::MyInfoStorage;
use crate::types::CallbackParams;

#[derive(Debug, Error, Diagnostic)]
pub enum LoopbackError {
    #[error("redirect_uri {0} is not a loopback http address")]
    #[diagnostic(
        code(myinfo::loopback::not_loopback),
        help("use a redirect_uri like http://127.0.0.1:3001/callback to log in from the terminal")
    )]
    NotLoopback(SmolStr),
    #[error("could not start the loopback server: {0}")]
    #[diagnostic(code(myinfo::loopback::bind))]
    Bind(BoxError),
    #[error("timed out waiting for the authorization redirect")]
    #[diagnostic(code(myinfo::loopback::timeout))]
    Timeout,
}

#[derive(Clone, Debug)]
pub struct LoopbackConfig {
    pub open_browser: bool,
    pub timeout_ms: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            open_browser: true,
            timeout_ms: 5 * 60 * 1000,
        }
    }
}

#[cfg(feature = "browser-open")]
fn try_open_in_browser(url: &str) -> bool {
    webbrowser::open(url).is_ok()
}
#[cfg(not(feature = "browser-open"))]
fn try_open_in_browser(_url: &str) -> bool {
    false
}

/// Socket address the redirect URI points at.
pub fn listen_addr(redirect: &Url) -> core::result::Result<SocketAddr, LoopbackError> {
    let not_loopback = || LoopbackError::NotLoopback(redirect.as_str().into());
    if !LoopbackRedirect.handles(redirect) {
        return Err(not_loopback());
    }
    let port = redirect.port_or_known_default().ok_or_else(not_loopback)?;
    let host = match redirect.host_str() {
        Some("localhost") | None => "127.0.0.1",
        Some(host) => host,
    };
    format!("{host}:{port}")
        .parse()
        .map_err(|_| not_loopback())
}

pub fn create_callback_router(
    request: &rouille::Request,
    path: &str,
    tx: &mpsc::Sender<CallbackParams>,
) -> rouille::Response {
    if request.method() != "GET" || request.url() != path {
        return rouille::Response::empty_404();
    }
    let params: CallbackParams =
        serde_html_form::from_str(request.raw_query_string()).unwrap_or_default();
    let message = if params.error.is_some() {
        "Login failed, return to the terminal for details."
    } else {
        "Logged in! You can close this window."
    };
    // only the first redirect matters
    let _ = tx.try_send(params);
    rouille::Response::text(message)
}

struct CallbackHandle {
    #[allow(dead_code)]
    server_handle: std::thread::JoinHandle<()>,
    server_stop: std::sync::mpsc::Sender<()>,
    callback_rx: mpsc::Receiver<CallbackParams>,
}

fn one_shot_server(addr: SocketAddr, path: String) -> core::result::Result<CallbackHandle, LoopbackError> {
    let (tx, callback_rx) = mpsc::channel(1);
    let server = Server::new(addr, move |request| create_callback_router(request, &path, &tx))
        .map_err(LoopbackError::Bind)?;
    let (server_handle, server_stop) = server.stoppable();
    Ok(CallbackHandle {
        server_handle,
        server_stop,
        callback_rx,
    })
}

impl<T, S> MyInfoClient<T, S>
where
    T: HttpClient + Send + Sync,
    S: MyInfoStorage,
{
    /// Run the whole login through a local server listening on the
    /// configured loopback `redirect_uri`. Returns the access token.
    pub async fn login_with_local_server(&self, cfg: LoopbackConfig) -> Result<SmolStr> {
        let redirect = &self.configuration().redirect_uri;
        let addr = listen_addr(redirect)?;
        let handle = one_shot_server(addr, redirect.path().to_owned())?;
        tracing::debug!(%addr, "loopback server listening");

        let auth_url = self.prepare_authorization_request().await?.url;
        println!("To log in with Singpass, visit:\n{auth_url}\n");
        if cfg.open_browser {
            let _ = try_open_in_browser(auth_url.as_str());
        }

        let mut callback_rx = handle.callback_rx;
        let cb = tokio::time::timeout(Duration::from_millis(cfg.timeout_ms), callback_rx.recv()).await;
        let _ = handle.server_stop.send(());
        match cb {
            Ok(Some(params)) => self.on_post_login(params).await,
            _ => Err(LoopbackError::Timeout.into()),
        }
    }
}
