// knhk-registry: service registry main entry point

use knhk_registry::RegistryConfig;
use std::env;
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("REGISTRY_CONFIG_PATH").ok();
    let config = match config_path {
        Some(path) => RegistryConfig::from_file(&path)?,
        None => RegistryConfig::default(),
    }
    .apply_env_overrides();

    if let Err(err) = knhk_registry::run(config).await {
        error!(error = %err, "registry server exited with an error");
        return Err(err);
    }
    Ok(())
}
