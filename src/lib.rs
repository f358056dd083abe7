// knhk-registry: service registry and framed liveness protocol
//
// Publish/subscribe provider discovery over a custom binary frame protocol,
// with hashed-timing-wheel idle detection and at-least-once push delivery.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod ack;
pub mod attachments;
pub mod channel;
pub mod channel_group;
pub mod clock;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod idle;
pub mod metrics;
pub mod model;
pub mod registry_context;
pub mod server;
pub mod timing_wheel;
pub mod transport;

pub use config::RegistryConfig;
pub use error::{RegistryError, RegistryResult};
pub use server::RegistryServer;

/// Initialize tracing, bootstrap the server, bind the listener, and run the
/// accept loop. Blocks until the listener errors.
pub async fn run(config: RegistryConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let bind_address = config.server.bind_address.clone();
    let backlog = config.server.so_backlog;
    let addr = bind_address.parse().map_err(|e| format!("invalid bind address {bind_address}: {e}"))?;

    let server = RegistryServer::bootstrap(config);
    let listener = transport::bind_listener(addr, backlog)?;

    tracing::info!(%bind_address, "registry listening");
    transport::run_accept_loop(listener, server).await;
    Ok(())
}
