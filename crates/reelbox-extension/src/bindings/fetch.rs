//! `fetch()` for extension scripts.
//!
//! Requests run on the host tokio runtime. Each URL, including every redirect
//! hop, is checked against the manifest allowlist and the private-address
//! block list before a connection is made.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Maximum HTTP response body size (10 MB).
pub const MAX_HTTP_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

const MAX_REDIRECTS: usize = 10;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("response body too large: more than {limit} bytes")]
    TooLarge { limit: usize },
}

/// Where an extension may send requests.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Host patterns, `*.example.com` globs allowed. Empty means any host.
    pub allowed_hosts: Vec<String>,
    pub block_private: bool,
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            block_private: true,
            timeout: Duration::from_secs(30),
            max_body_bytes: MAX_HTTP_RESPONSE_BYTES,
        }
    }
}

impl FetchPolicy {
    /// Parses `url_str` and runs every check that applies to it.
    pub fn check(&self, url_str: &str) -> Result<Url, FetchError> {
        let url = Url::parse(url_str).map_err(|_| FetchError::InvalidUrl(url_str.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::PermissionDenied(format!(
                "scheme '{}' is not allowed",
                url.scheme()
            )));
        }
        self.check_host(&url)?;
        if self.block_private {
            check_private_ip(&url)?;
        }
        Ok(url)
    }

    fn check_host(&self, url: &Url) -> Result<(), FetchError> {
        if self.allowed_hosts.is_empty() || self.allowed_hosts.iter().any(|h| h == "*") {
            return Ok(());
        }

        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(format!("URL has no host: {url}")))?;

        let matches = self.allowed_hosts.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == pattern
            }
        });

        if !matches {
            return Err(FetchError::PermissionDenied(format!(
                "host '{host}' is not in the allowlist {:?}",
                self.allowed_hosts
            )));
        }
        Ok(())
    }
}

/// Rejects loopback, private, link-local and cloud metadata addresses.
fn check_private_ip(url: &Url) -> Result<(), FetchError> {
    let host = match url.host_str() {
        Some(h) => h,
        None => return Ok(()),
    };

    let blocked = [
        "localhost",
        "127.0.0.1",
        "0.0.0.0",
        "[::1]",
        "169.254.169.254",
        "metadata.google.internal",
    ];
    if blocked.contains(&host) || host.ends_with(".localhost") {
        return Err(FetchError::PermissionDenied(format!(
            "requests to '{host}' are blocked (private/reserved address)"
        )));
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        let is_private = match ip {
            IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || (v6.segments()[0] & 0xfe00) == 0xfc00
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
            }
        };
        if is_private {
            return Err(FetchError::PermissionDenied(format!(
                "requests to private IP '{host}' are blocked"
            )));
        }
    }
    Ok(())
}

/// Request options as passed by the script.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Per-request timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// What the script's `Response` object is built from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub ok: bool,
    pub url: String,
    pub method: String,
    pub redirected: bool,
    pub headers: BTreeMap<String, String>,
    pub raw_headers: BTreeMap<String, Vec<String>>,
    pub cookies: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    pub body: String,
}

/// Per-sandbox HTTP client. Cheap to clone into spawned tasks.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl Fetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self, FetchError> {
        let redirect_policy = policy.clone();
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .redirect(reqwest::redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    attempt.error("too many redirects")
                } else if redirect_policy.check(attempt.url().as_str()).is_err() {
                    attempt.stop()
                } else {
                    attempt.follow()
                }
            }))
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = self.policy.check(&request.url)?;
        let method_name = request
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("unknown method '{method_name}'")))?;

        let mut req = self.client.request(method, url);
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = request.body {
            req = req.body(body);
        }
        if let Some(ms) = request.timeout {
            req = req.timeout(Duration::from_millis(ms));
        }

        let resp = req.send().await.map_err(|e| FetchError::Http(e.to_string()))?;
        self.read_response(method_name, &request.url, resp).await
    }

    /// Reads the response with the body size limit.
    async fn read_response(
        &self,
        method: String,
        requested: &str,
        mut resp: reqwest::Response,
    ) -> Result<FetchResponse, FetchError> {
        let limit = self.policy.max_body_bytes;
        let content_length = resp.content_length();
        if content_length.is_some_and(|len| len > limit as u64) {
            return Err(FetchError::TooLarge { limit });
        }

        let status = resp.status();
        let mut raw_headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in resp.headers() {
            raw_headers
                .entry(k.to_string())
                .or_default()
                .push(v.to_str().unwrap_or("").to_string());
        }
        let headers: BTreeMap<String, String> = raw_headers
            .iter()
            .map(|(k, values)| (k.clone(), values.join(", ")))
            .collect();
        let cookies: BTreeMap<String, String> = raw_headers
            .get("set-cookie")
            .into_iter()
            .flatten()
            .filter_map(|cookie| {
                let pair = cookie.split(';').next()?;
                let (name, value) = pair.split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        let url = resp.url().to_string();
        let redirected = Url::parse(requested).map_or(false, |u| u.as_str() != url);

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| FetchError::Http(e.to_string()))? {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            ok: status.is_success(),
            content_type: headers.get("content-type").cloned(),
            content_length,
            url,
            method,
            redirected,
            headers,
            raw_headers,
            cookies,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
