//! Storefront CLI and billing session binary
//!
//! Provides commands for initializing and validating a configuration and
//! for running a billing session against the in-memory backend.

use anyhow::{Context, Result};
use billing::{
    BillingClient, BillingEvent, CatalogEntry, InMemoryGateway, Offer, ProductKind, ProductSpec,
    PurchaseRecord, PurchaseState, SessionState, ShutdownController,
};
use cli::{Cli, Commands, LogFormatArg};
use config::{generate_default_config, load_config, save_config, validate_config, BillingConfig};
use observability::{init_default_logging, init_logging, init_metrics, LogFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Run {
            config,
            log_format,
            metrics_port,
            buy,
            owned,
        } => {
            run_command(RunArgs {
                config_path: config,
                log_format,
                metrics_port,
                buy,
                owned,
            })
            .await
        }
        Commands::Validate { config } => {
            init_default_logging("storefront")?;
            info!("Executing 'validate' command");
            validate_command(config).await
        }
        Commands::Init { output } => {
            init_default_logging("storefront")?;
            info!("Executing 'init' command");
            init_command(output).await
        }
    }
}

struct RunArgs {
    config_path: PathBuf,
    log_format: Option<LogFormatArg>,
    metrics_port: Option<u16>,
    buy: Vec<String>,
    owned: Vec<String>,
}

async fn run_command(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.config_path)?;

    // CLI overrides
    if let Some(format) = args.log_format {
        config.logging.format = format.as_str().to_string();
    }
    if let Some(port) = args.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }

    let format = LogFormat::parse(&config.logging.format).unwrap_or_default();
    let level = if config.logging.level.trim().is_empty() {
        config::default_log_level()
    } else {
        config.logging.level.clone()
    };
    init_logging("storefront", format, &level)?;
    info!(path = ?args.config_path, "Configuration loaded");

    let report = validate_config(&config);
    for warning in &report.warnings {
        warn!(field = %warning.field, message = %warning.message, "Configuration warning");
    }
    if !report.is_valid() {
        error!(
            error_count = report.errors.len(),
            "Configuration validation failed"
        );
        for err in &report.errors {
            error!("{}", err);
        }
        anyhow::bail!("Cannot start billing session due to configuration errors");
    }

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    let gateway = Arc::new(demo_gateway(&config, &args.owned));
    let client = BillingClient::from_config(&config, gateway);
    let controller = ShutdownController::with_ctrl_c();

    let printer = tokio::spawn(print_events(client.subscribe().into_stream()));

    let mut session = client.watch_session();
    let state = tokio::select! {
        _ = controller.wait_for_shutdown() => None,
        state = session.wait_for(|s| matches!(s, SessionState::Ready | SessionState::Failed)) => {
            state.ok().map(|s| *s)
        }
    };

    match state {
        Some(SessionState::Ready) => {
            info!(client = %config.client.name, "Session ready, press Ctrl+C to stop");
            wait_for_catalog(&client, &controller).await;
            for product_id in &args.buy {
                if let Err(e) = client.launch_purchase(product_id, None).await {
                    warn!(%product_id, error = %e, "Purchase not launched");
                }
            }
            controller.wait_for_shutdown().await;
        }
        Some(state) => warn!(%state, "Session did not become ready"),
        None => debug!("Interrupted before the session became ready"),
    }

    match client.ledger().await {
        Ok(ledger) => print_ledger(&ledger),
        Err(e) => warn!(error = %e, "Could not read purchase ledger"),
    }

    client.shutdown().await;
    drop(client);
    if let Err(e) = printer.await {
        warn!(error = %e, "Event printer ended abnormally");
    }

    info!("Storefront stopped");
    Ok(())
}

/// In-memory backend seeded from the configured products
///
/// Every product gets one offer priced by its position; launched purchases
/// complete immediately.
fn demo_gateway(config: &BillingConfig, owned: &[String]) -> InMemoryGateway {
    let mut gateway = InMemoryGateway::new().with_auto_complete();

    for (index, product) in config.products.iter().enumerate() {
        let spec = ProductSpec::from(product);
        let price_micros = 990_000 * (index as i64 + 1);
        let offer = Offer::new(
            format!("{}-default", spec.product_id),
            format!("offer-{}", uuid::Uuid::new_v4()),
            price_micros,
        );
        gateway = gateway.with_product(CatalogEntry::new(
            spec.product_id.clone(),
            spec.kind,
            vec![offer],
        ));

        if owned.contains(&spec.product_id) {
            let record = PurchaseRecord::new(
                format!("owned-{}", uuid::Uuid::new_v4()),
                [spec.product_id.clone()],
                PurchaseState::Purchased,
            );
            gateway = gateway.with_owned_purchase(spec.kind, record);
        }
    }

    for product_id in owned {
        if !config.products.iter().any(|p| &p.product_id == product_id) {
            warn!(%product_id, "Owned purchase for an unconfigured product, seeding as one-time");
            let record = PurchaseRecord::new(
                format!("owned-{}", uuid::Uuid::new_v4()),
                [product_id.clone()],
                PurchaseState::Purchased,
            );
            gateway = gateway.with_owned_purchase(ProductKind::OneTime, record);
        }
    }

    gateway
}

async fn wait_for_catalog(client: &BillingClient, controller: &ShutdownController) {
    let mut catalog = client.watch_catalog();
    tokio::select! {
        _ = controller.wait_for_shutdown() => {}
        _ = catalog.wait_for(|c| c.is_some()) => {}
    }
}

async fn print_events<S>(mut events: S)
where
    S: tokio_stream::Stream<Item = BillingEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        match event {
            BillingEvent::ProductsUpdated(catalog) => {
                println!("[catalog] cycle {} with {} products", catalog.cycle, catalog.len());
                for entry in catalog.entries.values() {
                    let price = entry
                        .cheapest_offer()
                        .map(|o| format!("{:.2}", o.price_micros as f64 / 1_000_000.0))
                        .unwrap_or_else(|| "-".to_string());
                    println!("  {} ({}) from {}", entry.product_id, entry.kind, price);
                }
            }
            BillingEvent::PurchaseSucceeded {
                product_id,
                restored,
            } => {
                let origin = if restored { "restored" } else { "new" };
                println!("[purchase] {} succeeded ({})", product_id, origin);
            }
            BillingEvent::PurchasePending { product_id } => {
                println!("[purchase] {} pending", product_id);
            }
            BillingEvent::Error { message } => {
                println!("[error] {}", message);
            }
        }
    }
}

fn print_ledger(ledger: &[PurchaseRecord]) {
    println!("\n=== Purchase Ledger ({}) ===", ledger.len());
    for record in ledger {
        let products: Vec<_> = record.product_ids.iter().map(String::as_str).collect();
        println!(
            "  {} [{}] {} acknowledged={}",
            record.token,
            products.join(","),
            record.state,
            record.acknowledged
        );
    }
}

async fn validate_command<P: AsRef<Path>>(config_path: P) -> Result<()> {
    info!(path = ?config_path.as_ref(), "Validating configuration");

    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "Failed to load configuration");
            anyhow::bail!(e);
        }
    };

    let report = validate_config(&config);

    println!("\n=== Configuration Validation Report ===\n");

    if !report.defaults_applied.is_empty() {
        println!("Defaults Applied ({}):", report.defaults_applied.len());
        for default in &report.defaults_applied {
            println!("  [info] {} = {}", default.field, default.value);
        }
        println!();
    }

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] [{}] {}", warning.field, warning.message);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {}", err);
        }
        println!();
        anyhow::bail!("Configuration validation failed");
    }

    println!("[ok] Configuration is valid!");
    println!();
    println!("Client: {}", config.client.name);
    println!(
        "Products: {} one-time, {} subscription",
        config.products_of(config::ProductKindConfig::OneTime).count(),
        config.products_of(config::ProductKindConfig::Subscription).count()
    );
    println!(
        "Reconnect: {} attempts, {} ms {:?} backoff",
        config.connection.max_attempts, config.connection.retry_delay_ms, config.connection.backoff
    );

    Ok(())
}

async fn init_command<P: AsRef<Path>>(output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!(?output_path, "Initializing new configuration file");

    let config = generate_default_config();

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    save_config(&config, output_path)?;

    println!("[ok] Configuration file created successfully!");
    println!();
    println!("Location: {:?}", output_path);
    println!();
    println!("This configuration includes:");
    println!("  - {} products (one-time and subscription)", config.products.len());
    println!(
        "  - Reconnection: {} attempts, {} ms apart",
        config.connection.max_attempts, config.connection.retry_delay_ms
    );
    println!();
    println!("Next steps:");
    println!("  1. Edit the product list to match your store");
    println!(
        "  2. Run 'storefront validate --config {:?}' to check configuration",
        output_path
    );
    println!(
        "  3. Run 'storefront run --config {:?} --buy remove_ads' to try a purchase",
        output_path
    );

    Ok(())
}
