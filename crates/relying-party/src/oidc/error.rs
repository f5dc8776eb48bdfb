use thiserror::Error;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("unknown OpenID provider `{0}`")]
    UnknownProvider(String),
    #[error("no `{0}` stored in the session")]
    MissingSessionValue(&'static str),
    #[error("provider discovery failed for `{issuer}`: {message}")]
    Discovery { issuer: String, message: String },
    #[error("webfinger lookup failed for `{hint}`: {message}")]
    WebFinger { hint: String, message: String },
    #[error("client registration failed: {0}")]
    Registration(String),
    #[error("invalid url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("provider returned `{error}`")]
    Authentication {
        error: String,
        description: Option<String>,
    },
    #[error("state returned by the provider does not match the session")]
    StateMismatch,
    #[error("provider did not return an authorization code")]
    MissingCode,
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("provider did not return an ID token")]
    MissingIdToken,
    #[error("ID token verification failed: {0}")]
    IdToken(String),
    #[error("userinfo request failed: {0}")]
    UserInfo(String),
    #[error("provider does not advertise an end_session_endpoint")]
    EndSessionUnsupported,
    #[error("failed to relay end-session response: {0}")]
    Relay(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl OidcError {
    pub(crate) fn invalid_url(url: &str, err: impl std::fmt::Display) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}
