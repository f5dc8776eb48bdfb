use std::{collections::BTreeMap, env, fs, path::Path};

use chrono::Duration;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LOGIN_CALLBACK_PATH: &str = "/openid/callback/login";
pub const LOGOUT_CALLBACK_PATH: &str = "/openid/callback/logout";

const DEFAULT_SESSION_COOKIE_AGE_SECS: i64 = 1_209_600;
const DEFAULT_SCOPES: [&str; 5] = ["openid", "profile", "email", "address", "phone"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for environment variable `{0}`")]
    InvalidVar(&'static str),
    #[error("failed to read OIDC settings file `{path}`: {source}")]
    SettingsFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid OIDC settings: {0}")]
    InvalidSettings(#[from] serde_json::Error),
    #[error("provider `{provider}` uses unsupported response type `{response_type}`")]
    UnsupportedResponseType {
        provider: String,
        response_type: String,
    },
    #[error("no OpenID providers configured and dynamic providers are disabled")]
    NoProviders,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: Option<String>,
    pub listen_addr: String,
    pub public_base_url: String,
    pub sentry_dsn: Option<String>,
    pub session: SessionConfig,
    pub oidc: OidcConfig,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub cookie_age: Duration,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub allow_dynamic_op: bool,
    pub create_unknown_user: bool,
    pub logout_redirect_url: String,
    pub settings: OidcSettings,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("SERVER_DATABASE_URL").or_else(|| lookup("DATABASE_URL"));

        let listen_addr =
            lookup("SERVER_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8081".to_string());

        let public_base_url = lookup("SERVER_PUBLIC_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8081".to_string())
            .trim_end_matches('/')
            .to_string();
        url::Url::parse(&public_base_url)
            .map_err(|_| ConfigError::InvalidVar("SERVER_PUBLIC_BASE_URL"))?;

        let cookie_age = match lookup("SESSION_COOKIE_AGE_SECS") {
            Some(value) => value
                .parse::<i64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::seconds)
                .ok_or(ConfigError::InvalidVar("SESSION_COOKIE_AGE_SECS"))?,
            None => Duration::seconds(DEFAULT_SESSION_COOKIE_AGE_SECS),
        };

        let session = SessionConfig {
            cookie_name: lookup("SESSION_COOKIE_NAME").unwrap_or_else(|| "sessionid".to_string()),
            cookie_age,
            cookie_secure: public_base_url.starts_with("https://"),
        };

        let allow_dynamic_op = parse_bool(&lookup, "OIDC_ALLOW_DYNAMIC_OP", true)?;
        let create_unknown_user = parse_bool(&lookup, "OIDC_CREATE_UNKNOWN_USER", true)?;
        let logout_redirect_url = lookup("LOGOUT_REDIRECT_URL").unwrap_or_else(|| "/".to_string());

        let settings = match lookup("OIDC_PROVIDERS_FILE") {
            Some(path) => OidcSettings::from_file(&path)?,
            None => {
                tracing::info!("OIDC_PROVIDERS_FILE not set, no static providers configured");
                OidcSettings::default()
            }
        }
        .with_public_base_url(&public_base_url);
        settings.validate()?;

        if settings.providers.is_empty() && !allow_dynamic_op {
            return Err(ConfigError::NoProviders);
        }

        Ok(Self {
            database_url,
            listen_addr,
            public_base_url,
            sentry_dsn: lookup("SENTRY_DSN"),
            session,
            oidc: OidcConfig {
                allow_dynamic_op,
                create_unknown_user,
                logout_redirect_url,
                settings,
            },
        })
    }
}

fn parse_bool<F>(lookup: &F, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidVar(name)),
    }
}

/// Nested OIDC settings, loaded from the JSON file named by `OIDC_PROVIDERS_FILE`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OidcSettings {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default)]
    pub default_behaviour: Behaviour,
    #[serde(default)]
    pub dynamic_client_registration_data: RegistrationData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub srv_discovery_url: String,
    #[serde(default)]
    pub behaviour: Option<Behaviour>,
    #[serde(default)]
    pub client_registration: Option<ClientRegistration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Behaviour {
    #[serde(default = "default_response_type")]
    pub response_type: String,
    #[serde(default = "default_scopes")]
    pub scope: Vec<String>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            response_type: default_response_type(),
            scope: default_scopes(),
        }
    }
}

fn default_response_type() -> String {
    "code".to_string()
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(|scope| scope.to_string()).collect()
}

/// Credentials of a client registered out of band with an OP.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub client_secret: Option<SecretString>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub post_logout_redirect_uris: Vec<String>,
}

/// Metadata sent when registering with an OP dynamically.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrationData {
    #[serde(default = "default_application_type")]
    pub application_type: String,
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub post_logout_redirect_uris: Vec<String>,
}

impl Default for RegistrationData {
    fn default() -> Self {
        Self {
            application_type: default_application_type(),
            contacts: Vec::new(),
            redirect_uris: Vec::new(),
            post_logout_redirect_uris: Vec::new(),
        }
    }
}

fn default_application_type() -> String {
    "web".to_string()
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.map(|secret| SecretString::new(secret.into())))
}

impl OidcSettings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::SettingsFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Fills empty redirect URI lists with this server's callback endpoints.
    pub fn with_public_base_url(mut self, public_base_url: &str) -> Self {
        let login_callback = format!("{public_base_url}{LOGIN_CALLBACK_PATH}");
        let logout_callback = format!("{public_base_url}{LOGOUT_CALLBACK_PATH}");

        let fill = |uris: &mut Vec<String>, default: &str| {
            if uris.is_empty() {
                uris.push(default.to_string());
            }
        };

        fill(
            &mut self.dynamic_client_registration_data.redirect_uris,
            &login_callback,
        );
        fill(
            &mut self
                .dynamic_client_registration_data
                .post_logout_redirect_uris,
            &logout_callback,
        );

        for provider in self.providers.values_mut() {
            if let Some(registration) = provider.client_registration.as_mut() {
                fill(&mut registration.redirect_uris, &login_callback);
                fill(&mut registration.post_logout_redirect_uris, &logout_callback);
            }
        }

        self
    }

    pub fn behaviour_for(&self, provider: &ProviderSettings) -> Behaviour {
        provider
            .behaviour
            .clone()
            .unwrap_or_else(|| self.default_behaviour.clone())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let check = |provider: &str, behaviour: &Behaviour| {
            if behaviour.response_type == "code" {
                Ok(())
            } else {
                Err(ConfigError::UnsupportedResponseType {
                    provider: provider.to_string(),
                    response_type: behaviour.response_type.clone(),
                })
            }
        };

        check("default", &self.default_behaviour)?;
        for (name, provider) in &self.providers {
            if let Some(behaviour) = provider.behaviour.as_ref() {
                check(name, behaviour)?;
            }
        }
        Ok(())
    }
}
