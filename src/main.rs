mod config;
mod data;
mod error;
mod portfolio;
mod profile;
mod report;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use config::RebalanceConfig;
use data::{MarketDataProvider, SnapshotProvider, YahooProvider};
use portfolio::{AllocationRequest, MergePolicy};
use profile::QuantileMethod;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MergePolicyChoice {
    ExcludeLiquidated,
    RetainOriginal,
}

impl From<MergePolicyChoice> for MergePolicy {
    fn from(value: MergePolicyChoice) -> Self {
        match value {
            MergePolicyChoice::ExcludeLiquidated => MergePolicy::ExcludeLiquidated,
            MergePolicyChoice::RetainOriginal => MergePolicy::RetainOriginal,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum QuantileChoice {
    NearestRank,
    Linear,
}

impl From<QuantileChoice> for QuantileMethod {
    fn from(value: QuantileChoice) -> Self {
        match value {
            QuantileChoice::NearestRank => QuantileMethod::NearestRank,
            QuantileChoice::Linear => QuantileMethod::Linear,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Rebalance a securities portfolio toward a risk-profile target allocation",
    after_help = "EXAMPLES:
    # Propose operations using live Yahoo Finance statistics
    cargo run --release -- --input request.json

    # Offline run against a saved market snapshot, with a readable summary
    cargo run --release -- --input request.json --snapshot snapshot.json --summary

    # List the supported risk profiles
    cargo run --release -- --list-profiles"
)]
struct Args {
    /// Allocation request JSON (investment_amount, risk_profile, available_assets, current_portfolio)
    #[arg(long, required_unless_present = "list_profiles")]
    input: Option<PathBuf>,

    /// Write the proposal JSON here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Use a market snapshot JSON file instead of fetching from Yahoo Finance
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// How sold positions take part in the final holdings merge
    #[arg(long, value_enum)]
    merge_policy: Option<MergePolicyChoice>,

    /// Estimator for the 90th percentile volatility cut-off
    #[arg(long, value_enum)]
    quantile_method: Option<QuantileChoice>,

    /// Trailing history range used for statistics (e.g. 1y, 6mo)
    #[arg(long)]
    history_range: Option<String>,

    /// Timeout in seconds for each market data request
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Print a human-readable summary to stderr
    #[arg(long)]
    summary: bool,

    /// List supported risk profiles and exit
    #[arg(long)]
    list_profiles: bool,
}

impl Args {
    fn apply_overrides(&self, mut cfg: RebalanceConfig) -> RebalanceConfig {
        if let Some(choice) = self.merge_policy {
            cfg.merge_policy = choice.into();
        }
        if let Some(choice) = self.quantile_method {
            cfg.quantile_method = choice.into();
        }
        if let Some(range) = &self.history_range {
            cfg.history_range = range.trim().to_string();
        }
        if let Some(secs) = self.timeout_secs {
            cfg.provider_timeout = Duration::from_secs(secs.clamp(1, 120));
        }
        cfg
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("portfolio_rebalancer=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    if args.list_profiles {
        report::print_profiles();
        return;
    }

    if let Err(e) = run(&args).await {
        error!("Rebalance failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> Result<()> {
    let input = args
        .input
        .as_deref()
        .ok_or(anyhow!("--input is required"))?;
    let request = load_request(input)?;
    let cfg = args.apply_overrides(RebalanceConfig::from_env());
    info!(
        "Config: range={}, timeout={:?}, merge={}, quantile={}",
        cfg.history_range,
        cfg.provider_timeout,
        cfg.merge_policy.as_str(),
        cfg.quantile_method.as_str()
    );

    match &args.snapshot {
        Some(path) => {
            let provider = SnapshotProvider::from_file(path)?;
            execute(args, &request, &provider, &cfg).await
        }
        None => {
            let provider = YahooProvider::new(&cfg)?;
            execute(args, &request, &provider, &cfg).await
        }
    }
}

async fn execute<P: MarketDataProvider>(
    args: &Args,
    request: &AllocationRequest,
    provider: &P,
    cfg: &RebalanceConfig,
) -> Result<()> {
    let result = portfolio::rebalance(request, provider, cfg).await?;
    report::write_result_json(&result, args.output.as_deref())?;

    if args.summary {
        let profile = request.validate()?.profile;
        report::print_summary(&result, profile);
    }
    Ok(())
}

fn load_request(path: &Path) -> Result<AllocationRequest> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| anyhow!("Invalid request {}: {}", path.display(), e))
}
