//! Pass-through GET proxy to a fixed set of upstream JSON APIs.
//!
//! One outbound request per call, no retries and no caching.

use anyhow::{bail, Result};
use axum::body::Bytes;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use reqwest::Url;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};

/// Built-in upstreams, overridable from the command line.
pub const DEFAULT_UPSTREAMS: &[(&str, &str)] = &[
    ("filterlists", "https://api.filterlists.com"),
    ("public-apis", "https://api.publicapis.org"),
    ("catfacts", "https://catfact.ninja"),
    ("jokes", "https://official-joke-api.appspot.com"),
    ("quotes", "https://api.quotable.io"),
];

/// Parse a `name=url` upstream override.
pub fn parse_upstream_arg(s: &str) -> Result<(String, String)> {
    let Some((name, url)) = s.split_once('=') else {
        bail!("expected NAME=URL, got {s:?}");
    };
    let (name, url) = (name.trim(), url.trim());
    if name.is_empty() || name.contains('/') {
        bail!("invalid upstream name: {name:?}");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("upstream url must be http(s): {url:?}");
    }
    Ok((name.to_string(), url.trim_end_matches('/').to_string()))
}

/// `.` or `..`, also when written with `%2e`.
fn is_dot_segment(seg: &str) -> bool {
    let seg = seg.to_ascii_lowercase().replace("%2e", ".");
    seg == "." || seg == ".."
}

pub struct UpstreamProxy {
    client: reqwest::Client,
    upstreams: BTreeMap<String, String>,
}

/// An upstream success response, relayed as-is.
#[derive(Debug)]
pub struct Relayed {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
}

impl IntoResponse for Relayed {
    fn into_response(self) -> Response {
        let content_type = HeaderValue::from_str(&self.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/json"));
        (self.status, [(header::CONTENT_TYPE, content_type)], self.body).into_response()
    }
}

impl UpstreamProxy {
    /// Start from [`DEFAULT_UPSTREAMS`] and apply `overrides` on top.
    pub fn new(client: reqwest::Client, overrides: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut upstreams: BTreeMap<String, String> = DEFAULT_UPSTREAMS
            .iter()
            .map(|(n, u)| (n.to_string(), u.to_string()))
            .collect();
        upstreams.extend(overrides);
        Self { client, upstreams }
    }

    pub fn upstream_names(&self) -> impl Iterator<Item = &str> {
        self.upstreams.keys().map(String::as_str)
    }

    /// Build the outbound URL for `name`.
    ///
    /// `raw_path` is the still percent-encoded request path after the upstream
    /// name, so encoded `?`, `#` and `/` reach the upstream unchanged. Dot
    /// segments (including encoded ones) and backslashes are refused, and the
    /// resolved URL must stay under the upstream's base path.
    pub fn target_url(&self, name: &str, raw_path: &str, query: Option<&str>) -> ApiResult<Url> {
        let base_str = self
            .upstreams
            .get(name)
            .ok_or_else(|| ApiError::NotFound(format!("unknown upstream: {name}")))?;
        let base = Url::parse(base_str)
            .map_err(|e| ApiError::Internal(format!("upstream {name} has an invalid url: {e}")))?;

        if raw_path.contains('\\') || raw_path.split('/').any(is_dot_segment) {
            return Err(ApiError::BadRequest("path may not contain '..' or '\\'".into()));
        }

        let joined = format!("{}/{}", base_str.trim_end_matches('/'), raw_path.trim_start_matches('/'));
        let mut url = Url::parse(&joined)
            .map_err(|e| ApiError::BadRequest(format!("invalid upstream path: {e}")))?;
        url.set_query(query.filter(|q| !q.is_empty()));
        url.set_fragment(None);

        let base_path = base.path().trim_end_matches('/');
        let under_base = url.path() == base_path
            || url.path().starts_with(&format!("{base_path}/"));
        if url.origin() != base.origin() || !under_base {
            return Err(ApiError::BadRequest("path escapes the upstream base".into()));
        }
        Ok(url)
    }

    pub async fn forward(&self, name: &str, raw_path: &str, query: Option<&str>) -> ApiResult<Relayed> {
        let url = self.target_url(name, raw_path, query)?;
        debug!(%url, "forwarding");

        let resp = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                warn!(%url, error = %e, "upstream request failed");
                if e.is_timeout() {
                    ApiError::GatewayTimeout(format!("upstream {name} timed out"))
                } else {
                    ApiError::bad_gateway(format!("failed to reach upstream {name}"), e.to_string())
                }
            })?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = resp.bytes().await.map_err(|e| {
            ApiError::bad_gateway(format!("failed to read response from upstream {name}"), e.to_string())
        })?;

        if !status.is_success() {
            warn!(%url, %status, "upstream returned an error status");
            let details = String::from_utf8_lossy(&body).into_owned();
            return Err(ApiError::upstream(
                status.as_u16(),
                format!("upstream {name} responded with {status}"),
                (!details.is_empty()).then_some(details),
            ));
        }

        Ok(Relayed { status, content_type, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> UpstreamProxy {
        UpstreamProxy::new(
            reqwest::Client::new(),
            [("local".to_string(), "http://127.0.0.1:9/api/".to_string())],
        )
    }

    #[test]
    fn parse_upstream_override() {
        let (name, url) = parse_upstream_arg("cats=https://catfact.ninja/").unwrap();
        assert_eq!(name, "cats");
        assert_eq!(url, "https://catfact.ninja");
        assert!(parse_upstream_arg("cats").is_err());
        assert!(parse_upstream_arg("cats=ftp://x").is_err());
        assert!(parse_upstream_arg("=https://x").is_err());
    }

    #[test]
    fn target_url_joins_path_and_query() {
        let p = proxy();
        assert_eq!(
            p.target_url("local", "lists/1", Some("a=1&b=2")).unwrap().as_str(),
            "http://127.0.0.1:9/api/lists/1?a=1&b=2"
        );
        assert_eq!(p.target_url("local", "", None).unwrap().as_str(), "http://127.0.0.1:9/api/");
        assert_eq!(
            p.target_url("catfacts", "fact", Some("")).unwrap().as_str(),
            "https://catfact.ninja/fact"
        );
    }

    #[test]
    fn target_url_keeps_encoded_characters() {
        let p = proxy();
        assert_eq!(
            p.target_url("local", "search/a%3Fb%3D1", Some("x=2")).unwrap().as_str(),
            "http://127.0.0.1:9/api/search/a%3Fb%3D1?x=2"
        );
        assert_eq!(
            p.target_url("local", "tags/c%23sharp", None).unwrap().as_str(),
            "http://127.0.0.1:9/api/tags/c%23sharp"
        );
        assert_eq!(
            p.target_url("local", "files/a%2Fb", None).unwrap().as_str(),
            "http://127.0.0.1:9/api/files/a%2Fb"
        );
    }

    #[test]
    fn target_url_rejects_unknown_and_traversal() {
        let p = proxy();
        assert!(matches!(p.target_url("nope", "x", None), Err(ApiError::NotFound(_))));
        for path in ["../admin", "a/../../admin", "%2e%2e/admin", ".%2E/admin", "..\\secret", "x/."] {
            assert!(
                matches!(p.target_url("local", path, None), Err(ApiError::BadRequest(_))),
                "{path}"
            );
        }
    }

    #[test]
    fn defaults_are_present() {
        let names: Vec<_> = proxy().upstream_names().map(str::to_string).collect();
        assert!(names.contains(&"filterlists".to_string()));
        assert!(names.contains(&"public-apis".to_string()));
        assert!(names.contains(&"local".to_string()));
    }
}
