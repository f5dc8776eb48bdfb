use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::{error, info};

use super::{OidcClient, OidcError, webfinger};
use crate::config::{Behaviour, OidcSettings, RegistrationData};

/// Clients for the configured providers plus those discovered from user hints.
pub struct OidcClients {
    configured: HashMap<String, Arc<OidcClient>>,
    discovered: RwLock<HashMap<String, Arc<OidcClient>>>,
    registration_data: RegistrationData,
    default_behaviour: Behaviour,
    http: reqwest::Client,
}

impl OidcClients {
    /// Sets up a client per configured provider. Providers that cannot be
    /// discovered or registered with are left out.
    pub async fn from_settings(settings: &OidcSettings, http: reqwest::Client) -> Self {
        let mut configured = HashMap::new();

        for (name, provider) in &settings.providers {
            let result = OidcClient::discover(
                name.clone(),
                &provider.srv_discovery_url,
                provider.client_registration.clone(),
                &settings.dynamic_client_registration_data,
                &settings.behaviour_for(provider),
                http.clone(),
            )
            .await;

            match result {
                Ok(client) => {
                    info!(provider = %name, issuer = %client.issuer(), "OpenID provider ready");
                    configured.insert(name.clone(), Arc::new(client));
                }
                Err(error) => {
                    error!(provider = %name, %error, "failed to set up OpenID provider; skipping");
                }
            }
        }

        Self {
            configured,
            discovered: RwLock::new(HashMap::new()),
            registration_data: settings.dynamic_client_registration_data.clone(),
            default_behaviour: settings.default_behaviour.clone(),
            http,
        }
    }

    /// Looks a client up by provider name, or by issuer for discovered OPs.
    pub fn get(&self, op: &str) -> Option<Arc<OidcClient>> {
        if let Some(client) = self.configured.get(op) {
            return Some(Arc::clone(client));
        }
        self.discovered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(op)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.configured.is_empty()
    }

    /// Names offered on the login page, sorted. Only providers that were set
    /// up at startup are listed: one that failed discovery or registration
    /// cannot be logged in with, so it is left out. The empty name is
    /// never listed.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .configured
            .keys()
            .filter(|name| !name.is_empty())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Finds the OP responsible for `hint` and returns a client registered
    /// with it, reusing an earlier registration for the same issuer.
    pub async fn dynamic_client(&self, hint: &str) -> Result<Arc<OidcClient>, OidcError> {
        let issuer = webfinger::discover_issuer(hint, &self.http).await?;

        if let Some(client) = self.get(&issuer) {
            return Ok(client);
        }

        let client = OidcClient::discover(
            issuer.clone(),
            &issuer,
            None,
            &self.registration_data,
            &self.default_behaviour,
            self.http.clone(),
        )
        .await?;
        info!(%issuer, hint, "discovered OpenID provider");

        let mut discovered = self
            .discovered
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let client = discovered
            .entry(issuer)
            .or_insert_with(|| Arc::new(client));
        Ok(Arc::clone(client))
    }
}
