use crate::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

#[instrument(skip(path))]
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BillingConfig> {
    let path = path.as_ref();
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    debug!("Config file content length: {} bytes", content.len());
    parse_config(&content)
}

/// Parse a configuration document, substituting environment variables first
pub fn parse_config(content: &str) -> Result<BillingConfig> {
    let substituted = substitution::substitute_env_vars(content)?;
    debug!("Environment variable substitution completed");

    let config: BillingConfig = serde_yaml::from_str(&substituted)
        .with_context(|| "Failed to parse YAML configuration")?;

    info!(
        products = config.products.len(),
        "Configuration loaded successfully"
    );
    Ok(config)
}

#[instrument]
pub fn generate_default_config() -> BillingConfig {
    BillingConfig {
        client: ClientConfig {
            name: "My Store".to_string(),
        },
        products: vec![
            ProductConfig {
                product_id: "remove_ads".to_string(),
                kind: ProductKindConfig::OneTime,
            },
            ProductConfig {
                product_id: "coins_500".to_string(),
                kind: ProductKindConfig::OneTime,
            },
            ProductConfig {
                product_id: "premium_monthly".to_string(),
                kind: ProductKindConfig::Subscription,
            },
        ],
        connection: ConnectionConfig::default(),
        events: EventsConfig::default(),
        processor: ProcessorConfig::default(),
        logging: LoggingConfig::default(),
        metrics: MetricsConfig::default(),
    }
}

#[instrument]
pub fn save_config<P: AsRef<Path> + std::fmt::Debug>(config: &BillingConfig, path: P) -> Result<()> {
    let path = path.as_ref();
    info!("Saving configuration to: {:?}", path);

    let yaml = serde_yaml::to_string(config)
        .with_context(|| "Failed to serialize configuration to YAML")?;

    fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    info!("Configuration saved successfully");
    Ok(())
}
