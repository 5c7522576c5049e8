use crate::portfolio::MergePolicy;
use crate::profile::QuantileMethod;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Trading days per year used to annualize daily statistics.
pub const TRADING_DAYS: f64 = 252.0;

/// Volatility quantile above which a symbol is excluded from every profile.
pub const EXCLUSION_QUANTILE: f64 = 0.9;

/// Finite stand-in for `1 / volatility` when volatility is zero.
pub const MAX_INVERSE_VOLATILITY: f64 = 1.0e6;

/// Upper bound on shares in a single buy.
pub const MAX_ORDER_QUANTITY: u64 = 1_000_000_000_000_000;

/// Trailing history used to derive per-symbol statistics.
pub const DEFAULT_HISTORY_RANGE: &str = "1y";

pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;
pub const DEFAULT_FETCH_DELAY_MS: u64 = 250;
pub const DEFAULT_CACHE_DIR: &str = ".cache";

/// Runtime settings for one rebalance run.
#[derive(Clone, Debug)]
pub struct RebalanceConfig {
    pub history_range: String,
    pub provider_timeout: Duration,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub fetch_delay: Duration,
    pub merge_policy: MergePolicy,
    pub quantile_method: QuantileMethod,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            history_range: DEFAULT_HISTORY_RANGE.to_string(),
            provider_timeout: Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            fetch_delay: Duration::from_millis(DEFAULT_FETCH_DELAY_MS),
            merge_policy: MergePolicy::default(),
            quantile_method: QuantileMethod::default(),
        }
    }
}

impl RebalanceConfig {
    /// Builds the configuration from `REBALANCE_*` environment variables.
    /// Missing or malformed values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let history_range = env_string("REBALANCE_HISTORY_RANGE")
            .unwrap_or(defaults.history_range);

        let provider_timeout = env_parse::<u64>("REBALANCE_PROVIDER_TIMEOUT_SECS")
            .map(|v| Duration::from_secs(v.clamp(1, 120)))
            .unwrap_or(defaults.provider_timeout);

        let cache_dir = env_string("REBALANCE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let cache_ttl = env_parse::<u64>("REBALANCE_CACHE_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_ttl);

        let fetch_delay = env_parse::<u64>("REBALANCE_FETCH_DELAY_MS")
            .map(|v| Duration::from_millis(v.clamp(0, 5_000)))
            .unwrap_or(defaults.fetch_delay);

        let merge_policy = match env_string("REBALANCE_MERGE_POLICY") {
            Some(raw) => MergePolicy::parse(&raw).unwrap_or_else(|| {
                warn!(
                    "Unknown REBALANCE_MERGE_POLICY={} ; defaulting to {}. Allowed values: exclude-liquidated | retain-original",
                    raw,
                    defaults.merge_policy.as_str()
                );
                defaults.merge_policy
            }),
            None => defaults.merge_policy,
        };

        let quantile_method = match env_string("REBALANCE_QUANTILE_METHOD") {
            Some(raw) => QuantileMethod::parse(&raw).unwrap_or_else(|| {
                warn!(
                    "Unknown REBALANCE_QUANTILE_METHOD={} ; defaulting to {}. Allowed values: nearest-rank | linear",
                    raw,
                    defaults.quantile_method.as_str()
                );
                defaults.quantile_method
            }),
            None => defaults.quantile_method,
        };

        Self {
            history_range,
            provider_timeout,
            cache_dir,
            cache_ttl,
            fetch_delay,
            merge_policy,
            quantile_method,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let cfg = RebalanceConfig::default();
        assert_eq!(cfg.history_range, "1y");
        assert_eq!(cfg.provider_timeout, Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS));
        assert_eq!(cfg.merge_policy, MergePolicy::ExcludeLiquidated);
        assert_eq!(cfg.quantile_method, QuantileMethod::NearestRank);
    }
}
