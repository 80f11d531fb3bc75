//! Boots the admin and live feed routes on `ACS_NOTIFY_BIND_ADDRESS`.
//!
//! ```text
//! RUST_LOG=webhook_delivery=debug,live_feed=info cargo run --example serve
//! curl -N 'http://127.0.0.1:8080/events/stream?token=demo-admin'
//! ```

use std::sync::Arc;
use std::time::Duration;

use acs_notify::{NewEvent, Notifier, NotifierConfig, RequestContext, StaticTokenAuthenticator, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = NotifierConfig::from_env()?;
    let bind_address = config.bind_address.clone();

    let auth = StaticTokenAuthenticator::new().with_token("demo-admin", Subscriber::new("1", "admin", true));
    let notifier = Notifier::builder()
        .config(config)
        .authenticator(Arc::new(auth))
        .build()?;

    // Emit a heartbeat so connected clients see traffic.
    let events = notifier.events().clone();
    tokio::spawn(async move {
        let ctx = RequestContext::new().with_user("system", "demo");
        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
            events
                .log_event(&ctx, NewEvent::new("system", "alert", "system").with_entity("demo", "heartbeat"))
                .await;
        }
    });

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "listening");

    let hub = notifier.hub().clone();
    axum::serve(listener, notifier.router())
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            hub.shutdown();
        })
        .await?;
    Ok(())
}
