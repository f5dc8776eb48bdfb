use relying_party::{Server, config::ServerConfig, init_tracing, install_crypto_provider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS operations
    install_crypto_provider();

    init_tracing();

    let config = ServerConfig::from_env()?;
    utils::sentry::init_once(config.sentry_dsn.as_deref(), "relying-party");

    Server::run(config).await
}
