//! Minimal HTTP client abstraction shared across crates.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// HTTP client trait for sending raw HTTP requests.
#[cfg_attr(not(target_arch = "wasm32"), trait_variant::make(Send))]
pub trait HttpClient {
    /// Error type returned by the HTTP client
    type Error: std::error::Error + Display + Send + Sync + 'static;

    /// Send an HTTP request and return the response.
    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>>;
}

/// Errors from the bundled `reqwest` transport.
#[cfg(feature = "reqwest-client")]
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ReqwestTransportError {
    /// The request could not be sent or the body could not be read
    #[error(transparent)]
    #[diagnostic(code(myinfo_common::http::transport))]
    Transport(#[from] reqwest::Error),
    /// The response could not be converted back into an `http::Response`
    #[error(transparent)]
    #[diagnostic(code(myinfo_common::http::response))]
    Response(#[from] http::Error),
}

#[cfg(feature = "reqwest-client")]
impl HttpClient for reqwest::Client {
    type Error = ReqwestTransportError;

    async fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> core::result::Result<http::Response<Vec<u8>>, Self::Error> {
        // Convert http::Request to reqwest::Request
        let (parts, body) = request.into_parts();

        let mut req = self.request(parts.method, parts.uri.to_string()).body(body);

        // Copy headers
        for (name, value) in parts.headers.iter() {
            req = req.header(name.as_str(), value.as_bytes());
        }

        let resp = req.send().await?;

        let mut builder = http::Response::builder().status(resp.status());
        for (name, value) in resp.headers().iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        let body = resp.bytes().await?.to_vec();

        Ok(builder.body(body)?)
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl<T: HttpClient + Sync> HttpClient for Arc<T> {
    type Error = T::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> + Send
    {
        self.as_ref().send_http(request)
    }
}

#[cfg(target_arch = "wasm32")]
impl<T: HttpClient> HttpClient for Arc<T> {
    type Error = T::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> {
        self.as_ref().send_http(request)
    }
}
