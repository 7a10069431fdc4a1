use std::sync::Arc;

use coachline::{
    AppState,
    config::Config,
    logging,
    store::{ChangeFeed, PublishingStore, SqliteMessageStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    logging::init_tracing(&config)?;

    let feed = ChangeFeed::new();
    let store = SqliteMessageStore::open(&config.database_url)
        .await?
        .with_max_body_chars(config.session.max_body_chars);
    let state = AppState::new(Arc::new(PublishingStore::new(store, feed.clone())), feed, &config);

    let app = coachline::app(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, env = %config.app_env, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    state.shutdown();
    tracing::info!("shut down");
    Ok(())
}
