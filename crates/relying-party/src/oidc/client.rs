use std::collections::BTreeMap;

use openidconnect::{
    AccessToken, AuthorizationCode, ClientId, ClientSecret, CsrfToken, IssuerUrl, Nonce,
    OAuth2TokenResponse, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
    TokenResponse as _,
    core::{CoreAuthenticationFlow, CoreJwsSigningAlgorithm},
};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use url::Url;

use super::{
    OidcCoreClient, OidcError, ProviderMetadata, UserInfoClaims,
    registration::register_client,
};
use crate::{
    config::{Behaviour, ClientRegistration, RegistrationData},
    session::{Session, keys},
};

/// The raw query an OP sent to the login callback.
pub type CallbackParams = BTreeMap<String, Vec<String>>;

/// A relying-party client bound to one OpenID provider.
#[derive(Clone, Debug)]
pub struct OidcClient {
    /// Provider name, or the issuer for OPs found through WebFinger.
    key: String,
    issuer: String,
    client: OidcCoreClient,
    scopes: Vec<Scope>,
    signing_algs: Vec<CoreJwsSigningAlgorithm>,
    end_session_endpoint: Option<String>,
    post_logout_redirect_uris: Vec<String>,
    http: reqwest::Client,
}

impl OidcClient {
    /// Discovers the OP behind `issuer` and binds a client to it, registering
    /// dynamically when no static registration is given.
    pub async fn discover(
        key: String,
        issuer: &str,
        registration: Option<ClientRegistration>,
        registration_data: &RegistrationData,
        behaviour: &Behaviour,
        http: reqwest::Client,
    ) -> Result<Self, OidcError> {
        let discovery_failed = |message: String| OidcError::Discovery {
            issuer: issuer.to_string(),
            message,
        };

        let issuer_url = IssuerUrl::new(issuer.to_string())
            .map_err(|err| OidcError::invalid_url(issuer, err))?;
        let metadata = ProviderMetadata::discover_async(issuer_url, &http)
            .await
            .map_err(|err| discovery_failed(err.to_string()))?;

        let registration = match registration {
            Some(registration) => registration,
            None => {
                let endpoint = metadata
                    .registration_endpoint()
                    .ok_or_else(|| {
                        OidcError::Registration(
                            "provider does not support dynamic registration".to_string(),
                        )
                    })?
                    .url()
                    .to_string();
                let registration = register_client(&endpoint, registration_data, &http).await?;
                info!(
                    issuer,
                    client_id = %registration.client_id,
                    "registered with provider"
                );
                registration
            }
        };

        let redirect_uri = registration
            .redirect_uris
            .first()
            .ok_or_else(|| OidcError::Registration("no redirect_uri registered".to_string()))?;
        let redirect_url = RedirectUrl::new(redirect_uri.clone())
            .map_err(|err| OidcError::invalid_url(redirect_uri, err))?;

        let signing_algs = metadata.id_token_signing_alg_values_supported().clone();
        let end_session_endpoint = metadata.additional_metadata().end_session_endpoint.clone();

        let client_secret = registration
            .client_secret
            .as_ref()
            .map(|secret| ClientSecret::new(secret.expose_secret().to_string()));
        let client: OidcCoreClient = openidconnect::Client::from_provider_metadata(
            metadata,
            ClientId::new(registration.client_id.clone()),
            client_secret,
        )
        .set_redirect_uri(redirect_url);

        // openidconnect always requests `openid` itself
        let scopes = behaviour
            .scope
            .iter()
            .filter(|scope| scope.as_str() != "openid")
            .map(|scope| Scope::new(scope.clone()))
            .collect();

        Ok(Self {
            key,
            issuer: issuer.to_string(),
            client,
            scopes,
            signing_algs,
            end_session_endpoint,
            post_logout_redirect_uris: registration.post_logout_redirect_uris,
            http,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn post_logout_redirect_uris(&self) -> &[String] {
        &self.post_logout_redirect_uris
    }

    /// Builds the authorization request URL and remembers its state, nonce
    /// and PKCE verifier in the session.
    pub fn create_authn_request(&self, session: &Session) -> Url {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let request = self.client.authorize_url(
            CoreAuthenticationFlow::AuthorizationCode,
            CsrfToken::new_random,
            Nonce::new_random,
        );
        let (url, state, nonce) = self
            .scopes
            .iter()
            .cloned()
            .fold(request, |request, scope| request.add_scope(scope))
            .set_pkce_challenge(pkce_challenge)
            .url();

        session.insert(keys::STATE, state.secret().as_str());
        session.insert(keys::NONCE, nonce.secret().as_str());
        session.insert(keys::PKCE_VERIFIER, pkce_verifier.secret().as_str());

        debug!(provider = %self.key, "created authentication request");
        url
    }

    /// Completes the authorization code flow for the query the OP redirected
    /// back with, returning the ID-token claims merged with the userinfo claims.
    pub async fn callback(
        &self,
        params: &CallbackParams,
        session: &Session,
    ) -> Result<Map<String, Value>, OidcError> {
        let param = |name: &str| {
            params
                .get(name)
                .and_then(|values| values.first())
                .map(String::as_str)
        };

        if let Some(error) = param("error") {
            return Err(OidcError::Authentication {
                error: error.to_string(),
                description: param("error_description").map(str::to_string),
            });
        }

        let expected_state = session
            .get_str(keys::STATE)
            .ok_or(OidcError::MissingSessionValue(keys::STATE))?;
        let returned_state = param("state").ok_or(OidcError::StateMismatch)?;
        if !bool::from(returned_state.as_bytes().ct_eq(expected_state.as_bytes())) {
            return Err(OidcError::StateMismatch);
        }

        let code = param("code").ok_or(OidcError::MissingCode)?;
        let nonce = session
            .get_str(keys::NONCE)
            .map(Nonce::new)
            .ok_or(OidcError::MissingSessionValue(keys::NONCE))?;

        let mut request = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .map_err(|err| OidcError::TokenExchange(err.to_string()))?;
        if let Some(verifier) = session.get_str(keys::PKCE_VERIFIER) {
            request = request.set_pkce_verifier(PkceCodeVerifier::new(verifier));
        }
        let token_response = request
            .request_async(&self.http)
            .await
            .map_err(|err| OidcError::TokenExchange(err.to_string()))?;

        let id_token = token_response
            .id_token()
            .ok_or(OidcError::MissingIdToken)?;
        let mut verifier = self.client.id_token_verifier();
        if !self.signing_algs.is_empty() {
            verifier = verifier.set_allowed_algs(self.signing_algs.clone());
        }
        let id_claims = id_token
            .claims(&verifier, &nonce)
            .map_err(|err| OidcError::IdToken(err.to_string()))?;

        session.insert(keys::ID_TOKEN_RAW, id_token.to_string());
        session.remove(keys::NONCE);
        session.remove(keys::PKCE_VERIFIER);

        let mut claims = to_object(id_claims).map_err(OidcError::IdToken)?;

        if self.client.user_info_url().is_some() {
            let userinfo = self
                .user_info(
                    token_response.access_token().clone(),
                    id_claims.subject().clone(),
                )
                .await?;
            claims.extend(userinfo);
        }

        Ok(claims)
    }

    async fn user_info(
        &self,
        access_token: AccessToken,
        subject: openidconnect::SubjectIdentifier,
    ) -> Result<Map<String, Value>, OidcError> {
        let userinfo: UserInfoClaims = self
            .client
            .user_info(access_token, Some(subject))
            .map_err(|err| OidcError::UserInfo(err.to_string()))?
            .request_async(&self.http)
            .await
            .map_err(|err| OidcError::UserInfo(err.to_string()))?;

        to_object(&userinfo).map_err(OidcError::UserInfo)
    }

    /// Sends the RP-initiated logout request to the OP's end-session
    /// endpoint. Redirects are handed back to the caller, not followed.
    pub async fn do_end_session_request(
        &self,
        state: &str,
        post_logout_redirect_uri: Option<&str>,
        id_token_hint: Option<&str>,
    ) -> Result<reqwest::Response, OidcError> {
        let url = self.end_session_url(state, post_logout_redirect_uri, id_token_hint)?;
        debug!(provider = %self.key, "sending end-session request");
        Ok(self.http.get(url).send().await?)
    }

    fn end_session_url(
        &self,
        state: &str,
        post_logout_redirect_uri: Option<&str>,
        id_token_hint: Option<&str>,
    ) -> Result<Url, OidcError> {
        let endpoint = self
            .end_session_endpoint
            .as_deref()
            .ok_or(OidcError::EndSessionUnsupported)?;
        let mut url = Url::parse(endpoint).map_err(|err| OidcError::invalid_url(endpoint, err))?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("state", state);
            if let Some(hint) = id_token_hint {
                qp.append_pair("id_token_hint", hint);
            }
            if let Some(uri) = post_logout_redirect_uri {
                qp.append_pair("post_logout_redirect_uri", uri);
            }
        }
        Ok(url)
    }
}

fn to_object<T: serde::Serialize>(claims: &T) -> Result<Map<String, Value>, String> {
    match serde_json::to_value(claims) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("claims are not a JSON object".to_string()),
        Err(err) => Err(err.to_string()),
    }
}
