use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use sqlx::PgPool;
use tracing::instrument;

use crate::{
    AppState,
    auth::{MemoryUserStore, OpenIdConnectBackend, UserStore},
    config::ServerConfig,
    db::{self, PgSessionStore, PgUserStore},
    oidc::OidcClients,
    routes,
    session::{MemorySessionStore, SessionStore},
};

const USER_AGENT: &str = "OpenIdRelyingParty/1.0";
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Server;

impl Server {
    #[instrument(
        name = "relying_party",
        skip(config),
        fields(listen_addr = %config.listen_addr)
    )]
    pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
        // OP redirects are relayed to the browser, never followed server-side
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to create HTTP client")?;

        let (sessions, users): (Arc<dyn SessionStore>, Arc<dyn UserStore>) =
            match config.database_url.as_deref() {
                Some(database_url) => {
                    let pool = db::create_pool(database_url)
                        .await
                        .context("failed to create postgres pool")?;

                    db::migrate(&pool)
                        .await
                        .context("failed to run database migrations")?;

                    spawn_session_purge(pool.clone());
                    (
                        Arc::new(PgSessionStore::new(pool.clone())),
                        Arc::new(PgUserStore::new(pool)),
                    )
                }
                None => {
                    tracing::warn!(
                        "DATABASE_URL not set; sessions and users are kept in memory and lost on restart"
                    );
                    (
                        Arc::new(MemorySessionStore::new()),
                        Arc::new(MemoryUserStore::new()),
                    )
                }
            };

        let clients =
            Arc::new(OidcClients::from_settings(&config.oidc.settings, http_client.clone()).await);
        if clients.is_empty() && !config.oidc.allow_dynamic_op {
            bail!("no OpenID provider could be set up and dynamic providers are disabled");
        }

        let backend = Arc::new(OpenIdConnectBackend::new(
            users,
            config.oidc.create_unknown_user,
        ));

        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .context("listen address is invalid")?;

        let state = AppState::new(config, clients, sessions, backend);
        let router = routes::router(state);

        let tcp_listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind tcp listener")?;

        tracing::info!(%addr, "relying party listening");

        axum::serve(tcp_listener, router.into_make_service())
            .await
            .context("relying party server failure")?;

        Ok(())
    }
}

fn spawn_session_purge(pool: PgPool) {
    let store = PgSessionStore::new(pool);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "purged expired sessions"),
                Err(error) => tracing::warn!(?error, "failed to purge expired sessions"),
            }
        }
    });
}
