use std::sync::Arc;

use crate::{
    auth::OpenIdConnectBackend, config::ServerConfig, oidc::OidcClients, session::SessionStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    clients: Arc<OidcClients>,
    sessions: Arc<dyn SessionStore>,
    backend: Arc<OpenIdConnectBackend>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        clients: Arc<OidcClients>,
        sessions: Arc<dyn SessionStore>,
        backend: Arc<OpenIdConnectBackend>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            clients,
            sessions,
            backend,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clients(&self) -> Arc<OidcClients> {
        Arc::clone(&self.clients)
    }

    pub fn sessions(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.sessions)
    }

    pub fn backend(&self) -> Arc<OpenIdConnectBackend> {
        Arc::clone(&self.backend)
    }
}
