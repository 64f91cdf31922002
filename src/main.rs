//! WebRTC-to-PSTN bridge sandbox
//!
//! Receives call-lifecycle webhooks from the Catapult voice platform,
//! correlates them with a registered browser session, and bridges the
//! inbound leg with a second leg to (or from) the user's WebRTC endpoint.

mod config;
mod models;
mod server;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("webrtc_bridge=info".parse()?),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = config::AppConfig::from_env()?;
    server::run_server(config).await
}
