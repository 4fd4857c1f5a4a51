use crate::*;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Client name is required")]
    MissingClientName,

    #[error("No products defined")]
    NoProducts,

    #[error("Product #{index}: product_id must not be empty")]
    EmptyProductId { index: usize },

    #[error("Duplicate product_id '{0}'")]
    DuplicateProduct(String),

    #[error("{field} must be a positive integer")]
    InvalidPositiveInteger { field: String },

    #[error("connection.max_delay_ms ({max_delay_ms}) must not be below connection.retry_delay_ms ({retry_delay_ms}) with exponential backoff")]
    InvalidBackoffCap { retry_delay_ms: u64, max_delay_ms: u64 },

    #[error("Invalid log format: {0}. Must be one of: pretty, json, compact")]
    InvalidLogFormat(String),

    #[error("Environment variable placeholder left unresolved in {field}")]
    UnresolvedEnvVar { field: String },
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DefaultApplied {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub defaults_applied: Vec<DefaultApplied>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            defaults_applied: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_default(&mut self, field: &str, value: &str) {
        self.defaults_applied.push(DefaultApplied {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_config(config: &BillingConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_client(&config.client, &mut report);
    validate_products(&config.products, &mut report);
    validate_connection(&config.connection, &mut report);
    validate_capacities(config, &mut report);
    validate_logging(&config.logging, &mut report);

    report
}

fn validate_client(client: &ClientConfig, report: &mut ValidationReport) {
    if client.name.trim().is_empty() {
        report.add_error(ValidationError::MissingClientName);
    } else if has_unresolved_env_vars(&client.name) {
        report.add_error(ValidationError::UnresolvedEnvVar {
            field: "client.name".to_string(),
        });
    }
}

fn validate_products(products: &[ProductConfig], report: &mut ValidationReport) {
    if products.is_empty() {
        report.add_error(ValidationError::NoProducts);
        return;
    }

    let mut seen = HashSet::new();
    for (index, product) in products.iter().enumerate() {
        if product.product_id.trim().is_empty() {
            report.add_error(ValidationError::EmptyProductId { index });
            continue;
        }

        if has_unresolved_env_vars(&product.product_id) {
            report.add_error(ValidationError::UnresolvedEnvVar {
                field: format!("products[{}].product_id", index),
            });
        }

        if !seen.insert(product.product_id.as_str()) {
            report.add_error(ValidationError::DuplicateProduct(product.product_id.clone()));
        }
    }

    for kind in [ProductKindConfig::OneTime, ProductKindConfig::Subscription] {
        if !products.iter().any(|p| p.kind == kind) {
            let kind_name = match kind {
                ProductKindConfig::OneTime => "one_time",
                ProductKindConfig::Subscription => "subscription",
            };
            report.add_warning(
                "products",
                &format!(
                    "No {} products configured; that catalog group will always be empty",
                    kind_name
                ),
            );
        }
    }
}

fn validate_connection(connection: &ConnectionConfig, report: &mut ValidationReport) {
    if connection.max_attempts == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "connection.max_attempts".to_string(),
        });
    }

    if connection.stable_after_ms == 0 {
        report.add_warning(
            "connection.stable_after_ms",
            "Every disconnect refills the attempt budget; a flapping backend is retried forever",
        );
    }

    if connection.retry_delay_ms == 0 {
        report.add_warning(
            "connection.retry_delay_ms",
            "Reconnection attempts will be made back to back",
        );
    }

    if connection.backoff == BackoffConfig::Exponential
        && connection.max_delay_ms < connection.retry_delay_ms
    {
        report.add_error(ValidationError::InvalidBackoffCap {
            retry_delay_ms: connection.retry_delay_ms,
            max_delay_ms: connection.max_delay_ms,
        });
    }

    if connection.backoff == BackoffConfig::Fixed
        && connection.max_delay_ms != default_max_delay_ms()
    {
        report.add_warning("connection.max_delay_ms", "Only used with exponential backoff");
    }
}

fn validate_capacities(config: &BillingConfig, report: &mut ValidationReport) {
    if config.events.capacity == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "events.capacity".to_string(),
        });
    }

    if config.processor.mailbox_capacity == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "processor.mailbox_capacity".to_string(),
        });
    }
}

fn validate_logging(logging: &LoggingConfig, report: &mut ValidationReport) {
    let valid_formats = ["pretty", "json", "compact"];
    if !valid_formats.contains(&logging.format.to_lowercase().as_str()) {
        report.add_error(ValidationError::InvalidLogFormat(logging.format.clone()));
    }

    if logging.level.trim().is_empty() {
        report.add_default("logging.level", &default_log_level());
    }
}
