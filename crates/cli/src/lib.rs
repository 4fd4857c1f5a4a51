use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "storefront")]
#[command(about = "Storefront - in-app purchase engine for a commerce backend")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a billing session against the in-memory backend
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "storefront.yaml")]
        config: PathBuf,

        /// Override the configured log format
        #[arg(long, value_enum)]
        log_format: Option<LogFormatArg>,

        /// Override the configured metrics port (also enables metrics)
        #[arg(long)]
        metrics_port: Option<u16>,

        /// Launch a purchase of this product once the session is ready (repeatable)
        #[arg(long = "buy", value_name = "PRODUCT_ID")]
        buy: Vec<String>,

        /// Seed the backend with an owned purchase of this product (repeatable)
        #[arg(long = "owned", value_name = "PRODUCT_ID")]
        owned: Vec<String>,
    },

    /// Validate configuration without starting a session
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "storefront.yaml")]
        config: PathBuf,
    },

    /// Initialize a new configuration file with all defaults
    Init {
        /// Output path for the new configuration file
        #[arg(short, long, default_value = "storefront.yaml")]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    /// Human-readable, colored
    Pretty,
    /// One JSON object per line
    Json,
    /// Single-line, less verbose
    Compact,
}

impl LogFormatArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormatArg::Pretty => "pretty",
            LogFormatArg::Json => "json",
            LogFormatArg::Compact => "compact",
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
