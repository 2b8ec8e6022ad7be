// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction and shared request headers.

use core::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use tracing::error;

use crate::constants::{AUTH_EMAIL_HEADER, AUTH_TOKEN_HEADER};
use crate::errors::Error;

/// Builds a client, falling back to a direct connection when the proxy is
/// unusable. Configured senders go through [`build_client`] instead so a bad
/// proxy is rejected.
#[must_use]
pub fn get_client(proxy: Option<&str>, timeout: Duration) -> reqwest::Client {
    match build_client(proxy, timeout) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(None, timeout) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

/// Builds the client shared by the dispatcher, device API and metrics reporter.
pub fn build_client(proxy: Option<&str>, timeout: Duration) -> Result<reqwest::Client, Error> {
    let mut client = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if let Some(url) = proxy {
        let proxy = reqwest::Proxy::all(url).map_err(|e| Error::InvalidUrl {
            name: "proxy",
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        client = client.proxy(proxy);
    }

    Ok(client.build()?)
}

/// Credential headers sent with every request.
pub fn auth_headers(email: &str, token: &str) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTH_EMAIL_HEADER,
        HeaderValue::from_str(email)
            .map_err(|_| Error::InvalidConfig("email is not a valid header value".into()))?,
    );
    let mut token = HeaderValue::from_str(token)
        .map_err(|_| Error::InvalidConfig("API token is not a valid header value".into()))?;
    token.set_sensitive(true);
    headers.insert(AUTH_TOKEN_HEADER, token);
    Ok(headers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_headers() {
        let headers = auth_headers("ops@example.com", "secret").expect("valid headers");
        assert_eq!(headers.get(AUTH_EMAIL_HEADER).unwrap(), "ops@example.com");
        assert!(headers.get(AUTH_TOKEN_HEADER).unwrap().is_sensitive());
    }

    #[test]
    fn test_auth_headers_reject_control_characters() {
        assert!(matches!(
            auth_headers("ops@example.com", "bad\ntoken"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_build_client_rejects_invalid_proxy() {
        match build_client(Some("::not a proxy::"), Duration::from_secs(1)) {
            Err(Error::InvalidUrl { name, url, .. }) => {
                assert_eq!(name, "proxy");
                assert_eq!(url, "::not a proxy::");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(build_client(Some("http://proxy:3128"), Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_invalid_proxy_falls_back() {
        // Must not panic; the direct client is returned instead.
        let _client = get_client(Some("::not a proxy::"), Duration::from_secs(1));
    }
}
