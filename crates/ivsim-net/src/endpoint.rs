//! ---
//! ivsim_section: "05-networking-external-interfaces"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Device provisioning and hub transport adapters."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Response;
use url::Url;

use crate::NetError;

/// Parse a bare host (`example.net`) or a full base URL into a base URL.
pub(crate) fn base_url(host: &str) -> Result<Url, NetError> {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        Ok(Url::parse(host)?)
    } else {
        Ok(Url::parse(&format!("https://{host}"))?)
    }
}

/// `host[:port]` part of a base URL, used as the signed resource prefix.
pub(crate) fn authority(base: &Url) -> String {
    match (base.host_str(), base.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        _ => base.as_str().to_owned(),
    }
}

/// Append percent-encoded path segments and the `api-version` query.
pub(crate) fn service_url(base: &Url, segments: &[&str], api_version: &str) -> Result<Url, NetError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .extend(segments);
    url.query_pairs_mut().append_pair("api-version", api_version);
    Ok(url)
}

/// Delay requested via `Retry-After` (whole seconds only).
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Turn a non-success response into [`NetError::Status`].
pub(crate) async fn ensure_success(
    operation: &'static str,
    response: Response,
) -> Result<Response, NetError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(NetError::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}
