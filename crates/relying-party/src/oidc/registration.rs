use secrecy::SecretString;
use serde::Deserialize;

use super::OidcError;
use crate::config::{ClientRegistration, RegistrationData};

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    client_secret: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
    #[serde(default)]
    post_logout_redirect_uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Registers this relying party at the OP's registration endpoint.
///
/// URI lists missing from the response fall back to the requested ones.
pub async fn register_client(
    endpoint: &str,
    data: &RegistrationData,
    http: &reqwest::Client,
) -> Result<ClientRegistration, OidcError> {
    let response = http
        .post(endpoint)
        .header("Accept", "application/json")
        .json(data)
        .send()
        .await
        .map_err(|err| OidcError::Registration(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let message = match response.json::<RegistrationErrorResponse>().await {
            Ok(RegistrationErrorResponse {
                error,
                error_description: Some(description),
            }) => format!("{error}: {description}"),
            Ok(RegistrationErrorResponse { error, .. }) => error,
            Err(_) => format!("endpoint returned {status}"),
        };
        return Err(OidcError::Registration(message));
    }

    let registered: RegistrationResponse = response
        .json()
        .await
        .map_err(|err| OidcError::Registration(format!("invalid response: {err}")))?;

    let or_requested = |uris: Vec<String>, requested: &[String]| {
        if uris.is_empty() {
            requested.to_vec()
        } else {
            uris
        }
    };

    Ok(ClientRegistration {
        client_id: registered.client_id,
        client_secret: registered
            .client_secret
            .map(|secret| SecretString::new(secret.into())),
        redirect_uris: or_requested(registered.redirect_uris, &data.redirect_uris),
        post_logout_redirect_uris: or_requested(
            registered.post_logout_redirect_uris,
            &data.post_logout_redirect_uris,
        ),
    })
}
