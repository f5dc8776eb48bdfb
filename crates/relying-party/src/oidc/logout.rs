use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
    },
    response::Response,
};

use super::OidcError;
use crate::config::LOGOUT_CALLBACK_PATH;

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Picks the post-logout redirect URI to send to the OP.
///
/// Nothing is sent without a requested next page. Otherwise the first
/// registered URI containing the next page wins, then the first one
/// containing the logout callback path, then the first one registered.
pub fn select_post_logout_redirect_uri<'a>(
    registered: &'a [String],
    next_page: Option<&str>,
) -> Option<&'a str> {
    let next_page = next_page?;
    registered
        .iter()
        .find(|uri| uri.contains(next_page))
        .or_else(|| {
            registered
                .iter()
                .find(|uri| uri.contains(LOGOUT_CALLBACK_PATH))
        })
        .or_else(|| registered.first())
        .map(String::as_str)
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
}

/// Rebuilds the OP's end-session response for the browser.
pub async fn relay_end_session_response(
    response: reqwest::Response,
) -> Result<Response, OidcError> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|err| OidcError::Relay(err.to_string()))?;
    build_relayed_response(status, &headers, body)
}

fn build_relayed_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, OidcError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("text/plain"));

    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type);

    // the body is re-framed, so the upstream length is dropped as well
    for (name, value) in headers {
        if name == CONTENT_TYPE || name == CONTENT_LENGTH || is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from(body))
        .map_err(|err| OidcError::Relay(err.to_string()))
}

/// Fallback when logging out at the OP failed.
pub fn home_redirect() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    let headers = response.headers_mut();
    headers.insert(LOCATION, HeaderValue::from_static("/"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
