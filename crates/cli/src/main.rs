mod commands;
mod http_payout;
mod ledger;

use std::path::PathBuf;
use std::process;

use bazaar_engine::MarketConfig;
use bazaar_storage::UserId;
use clap::{Parser, Subcommand, ValueEnum};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Bazaar marketplace settlement tooling.
#[derive(Parser)]
#[command(name = "bazaar", version, about = "Bazaar marketplace settlement tooling")]
struct Cli {
    /// Path to a TOML marketplace configuration
    #[arg(long, global = true, env = "BAZAAR_CONFIG")]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress logs and error reports
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
pub(crate) struct PeriodArgs {
    /// Period start, inclusive (RFC 3339)
    #[arg(long, value_parser = parse_timestamp)]
    pub(crate) from: OffsetDateTime,
    /// Period end, exclusive (RFC 3339)
    #[arg(long, value_parser = parse_timestamp)]
    pub(crate) to: OffsetDateTime,
}

#[derive(Subcommand)]
enum Commands {
    /// Settle one seller's period from a ledger file
    Settle {
        /// JSON ledger of sellers, orders and verifications
        #[arg(long)]
        ledger: PathBuf,
        /// Seller to settle
        #[arg(long, value_parser = parse_user_id)]
        seller: UserId,
        #[command(flatten)]
        period: PeriodArgs,
    },

    /// Settle every seller with income in the period
    SettleAll {
        #[arg(long)]
        ledger: PathBuf,
        #[command(flatten)]
        period: PeriodArgs,
    },

    /// Show the fee and revenue split for a verification level
    Quote {
        /// Verification level (0-3)
        #[arg(long)]
        level: u8,
    },

    /// Settle a seller's period and send the payout
    Payout {
        #[arg(long)]
        ledger: PathBuf,
        #[arg(long, value_parser = parse_user_id)]
        seller: UserId,
        #[command(flatten)]
        period: PeriodArgs,
        /// Transfer endpoint of the payout provider
        #[arg(long)]
        endpoint: String,
        /// Bearer token for the payout provider
        #[arg(long, env = "BAZAAR_PAYOUT_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },

    /// Load, validate and print the configuration
    CheckConfig,
}

fn parse_timestamp(s: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(s, &Rfc3339).map_err(|e| format!("invalid RFC 3339 timestamp: {e}"))
}

fn parse_user_id(s: &str) -> Result<UserId, String> {
    UserId::parse(s).map_err(|e| format!("invalid user id: {e}"))
}

fn init_tracing(quiet: bool) {
    let filter = if quiet {
        tracing_subscriber::EnvFilter::new("off")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,bazaar_engine=debug".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(msg) => {
            report_error(&msg, cli.output, cli.quiet);
            process::exit(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to start runtime: {e}"), cli.output, cli.quiet);
            process::exit(1);
        }
    };

    let outcome = match cli.command {
        Commands::Settle {
            ledger,
            seller,
            period,
        } => rt.block_on(commands::cmd_settle(&ledger, seller, &period, config, cli.output)),
        Commands::SettleAll { ledger, period } => {
            rt.block_on(commands::cmd_settle_all(&ledger, &period, config, cli.output))
        }
        Commands::Quote { level } => commands::cmd_quote(level, &config, cli.output),
        Commands::Payout {
            ledger,
            seller,
            period,
            endpoint,
            api_key,
        } => rt.block_on(commands::cmd_payout(
            commands::PayoutOptions {
                ledger: &ledger,
                seller,
                period: &period,
                endpoint,
                api_key,
            },
            config,
            cli.output,
        )),
        Commands::CheckConfig => commands::cmd_check_config(&config, cli.output),
    };

    if let Err(msg) = outcome {
        report_error(&msg, cli.output, cli.quiet);
        process::exit(1);
    }
}

/// Read `path` as TOML, or fall back to defaults when no path is given.
fn load_config(path: Option<&std::path::Path>) -> Result<MarketConfig, String> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("error reading config '{}': {}", path.display(), e))?;
            toml::from_str::<MarketConfig>(&text)
                .map_err(|e| format!("error parsing config '{}': {}", path.display(), e))?
        }
        None => MarketConfig::default(),
    };
    config
        .validate()
        .map_err(|e| format!("invalid config: {e}"))?;
    Ok(config)
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("error: {}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
