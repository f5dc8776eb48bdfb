use serde::Deserialize;
use url::Url;

use super::OidcError;

const ISSUER_REL: &str = "http://openid.net/specs/connect/1.0/issuer";

#[derive(Debug, Deserialize)]
struct WebFingerResponse {
    #[serde(default)]
    links: Vec<WebFingerLink>,
}

#[derive(Debug, Deserialize)]
struct WebFingerLink {
    rel: String,
    href: Option<String>,
}

/// Resolves the issuer of the OP responsible for a user-supplied hint.
///
/// The hint may be an e-mail style identifier (`alice@example.com`), an
/// `acct:` URI, a URL or a bare host.
pub async fn discover_issuer(hint: &str, http: &reqwest::Client) -> Result<String, OidcError> {
    let url = webfinger_url(hint)?;
    let failed = |message: String| OidcError::WebFinger {
        hint: hint.to_string(),
        message,
    };

    let response = http
        .get(url)
        .header("Accept", "application/jrd+json")
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|err| failed(err.to_string()))?;

    let document: WebFingerResponse = response
        .json()
        .await
        .map_err(|err| failed(format!("invalid response: {err}")))?;

    document
        .links
        .into_iter()
        .find(|link| link.rel == ISSUER_REL)
        .and_then(|link| link.href)
        .ok_or_else(|| failed("no issuer link in response".to_string()))
}

fn webfinger_url(hint: &str) -> Result<Url, OidcError> {
    let hint = hint.trim();
    let (resource, origin) = normalize(hint)?;

    let mut url = origin;
    url.set_path("/.well-known/webfinger");
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut()
        .append_pair("resource", &resource)
        .append_pair("rel", ISSUER_REL);
    Ok(url)
}

/// Returns the WebFinger resource and the origin to query for it.
fn normalize(hint: &str) -> Result<(String, Url), OidcError> {
    if let Some(account) = hint.strip_prefix("acct:") {
        return account_origin(hint, account).map(|origin| (hint.to_string(), origin));
    }

    if hint.starts_with("https://") || hint.starts_with("http://") {
        let url = Url::parse(hint).map_err(|err| OidcError::invalid_url(hint, err))?;
        return Ok((hint.to_string(), url));
    }

    if hint.contains('@') && !hint.contains('/') {
        return account_origin(hint, hint).map(|origin| (format!("acct:{hint}"), origin));
    }

    let resource = format!("https://{hint}");
    let url = Url::parse(&resource).map_err(|err| OidcError::invalid_url(hint, err))?;
    Ok((resource, url))
}

fn account_origin(hint: &str, account: &str) -> Result<Url, OidcError> {
    let host = account
        .rsplit_once('@')
        .map(|(_, host)| host)
        .filter(|host| !host.is_empty())
        .ok_or_else(|| OidcError::WebFinger {
            hint: hint.to_string(),
            message: "missing host in account identifier".to_string(),
        })?;
    Url::parse(&format!("https://{host}")).map_err(|err| OidcError::invalid_url(hint, err))
}
