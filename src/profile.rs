use crate::config::{EXCLUSION_QUANTILE, MAX_INVERSE_VOLATILITY};
use crate::data::SymbolStats;
use crate::error::RebalanceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

// ──────────────────────────────────────────────────────────────────────────────
// Risk Profiles
// ──────────────────────────────────────────────────────────────────────────────

/// Investor risk profile. Each variant owns one weighting formula.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
    Balanced,
    Growth,
}

impl RiskProfile {
    pub const ALL: [RiskProfile; 5] = [
        RiskProfile::Conservative,
        RiskProfile::Moderate,
        RiskProfile::Aggressive,
        RiskProfile::Balanced,
        RiskProfile::Growth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
            Self::Balanced => "balanced",
            Self::Growth => "growth",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Conservative => "Prioritizes low-volatility securities to reduce risk.",
            Self::Moderate => "Balances risk and return; suited to a mixed strategy.",
            Self::Aggressive => "Prioritizes high expected return, accepting higher volatility.",
            Self::Balanced => "Even blend of return and minimal risk.",
            Self::Growth => "Growth oriented: favors high return while penalizing high volatility.",
        }
    }

    /// Raw (unnormalized) weight for one symbol under this profile.
    pub fn raw_weight(self, average_return: f64, volatility: f64) -> f64 {
        match self {
            Self::Conservative => inverse_volatility(volatility),
            Self::Moderate => average_return * inverse_volatility(volatility),
            Self::Aggressive => average_return,
            Self::Balanced => (average_return + inverse_volatility(volatility)) / 2.0,
            Self::Growth => average_return * 2.0 - volatility,
        }
    }
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskProfile {
    type Err = RebalanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| RebalanceError::InvalidProfile(s.to_string()))
    }
}

fn inverse_volatility(volatility: f64) -> f64 {
    if volatility > 0.0 {
        (1.0 / volatility).min(MAX_INVERSE_VOLATILITY)
    } else {
        MAX_INVERSE_VOLATILITY
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Quantile
// ──────────────────────────────────────────────────────────────────────────────

/// Sample quantile estimator used for the volatility exclusion threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QuantileMethod {
    /// `ceil(q * n)`-th smallest value (inverse empirical CDF).
    #[default]
    NearestRank,
    /// Linear interpolation at position `q * (n - 1)`.
    Linear,
}

impl QuantileMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NearestRank => "nearest-rank",
            Self::Linear => "linear",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nearest-rank" | "nearest_rank" | "nearest" => Some(Self::NearestRank),
            "linear" => Some(Self::Linear),
            _ => None,
        }
    }
}

/// Returns the `q` quantile of `values`, or `None` for an empty input.
pub fn quantile(values: &[f64], q: f64, method: QuantileMethod) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let q = q.clamp(0.0, 1.0);

    let value = match method {
        QuantileMethod::NearestRank => {
            let rank = (q * n as f64 - 1e-9).ceil() as usize;
            sorted[rank.clamp(1, n) - 1]
        }
        QuantileMethod::Linear => {
            let pos = q * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    };
    Some(value)
}

// ──────────────────────────────────────────────────────────────────────────────
// Weight Calculator
// ──────────────────────────────────────────────────────────────────────────────

/// Computes raw weights for every symbol in `stats` under `profile`.
///
/// Symbols whose volatility is strictly above the `EXCLUSION_QUANTILE` of the
/// volatilities in this call get weight 0. The threshold only depends on the
/// symbols passed in.
pub fn calculate_weights(
    stats: &[&SymbolStats],
    profile: RiskProfile,
    method: QuantileMethod,
) -> BTreeMap<String, f64> {
    let volatilities: Vec<f64> = stats.iter().map(|s| s.volatility).collect();
    let threshold = quantile(&volatilities, EXCLUSION_QUANTILE, method);

    stats
        .iter()
        .map(|s| {
            let excluded = threshold.is_some_and(|t| s.volatility > t);
            let weight = if excluded {
                debug!(
                    "{}: volatility {:.4} above exclusion threshold {:.4}, weight forced to 0",
                    s.symbol,
                    s.volatility,
                    threshold.unwrap_or_default()
                );
                0.0
            } else {
                profile.raw_weight(s.average_return, s.volatility)
            };
            (s.symbol.clone(), weight)
        })
        .collect()
}

/// Normalizes raw weights to sum to 1. Negative weights are clamped to 0
/// (long-only). Returns `None` when no weight is left to distribute.
pub fn normalize_weights(raw: &BTreeMap<String, f64>) -> Option<BTreeMap<String, f64>> {
    let total: f64 = raw.values().map(|w| w.max(0.0)).sum();
    if total <= 0.0 || !total.is_finite() {
        return None;
    }
    Some(
        raw.iter()
            .map(|(symbol, w)| (symbol.clone(), w.max(0.0) / total))
            .collect(),
    )
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(symbol: &str, volatility: f64, average_return: f64) -> SymbolStats {
        SymbolStats {
            symbol: symbol.to_string(),
            price: 100.0,
            average_return,
            volatility,
        }
    }

    fn ten_symbols() -> Vec<SymbolStats> {
        (0..10)
            .map(|i| stats(&format!("S{i}"), 0.05 + i as f64 * 0.05, 0.02 * (i as f64 - 3.0)))
            .collect()
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!("conservative".parse::<RiskProfile>(), Ok(RiskProfile::Conservative));
        assert_eq!(" Growth ".parse::<RiskProfile>(), Ok(RiskProfile::Growth));
        assert_eq!(
            "yolo".parse::<RiskProfile>(),
            Err(RebalanceError::InvalidProfile("yolo".to_string()))
        );
    }

    #[test]
    fn test_profile_formulas() {
        let (r, v) = (0.2, 0.5);
        assert!((RiskProfile::Conservative.raw_weight(r, v) - 2.0).abs() < 1e-12);
        assert!((RiskProfile::Moderate.raw_weight(r, v) - 0.4).abs() < 1e-12);
        assert!((RiskProfile::Aggressive.raw_weight(r, v) - 0.2).abs() < 1e-12);
        assert!((RiskProfile::Balanced.raw_weight(r, v) - 1.1).abs() < 1e-12);
        assert!((RiskProfile::Growth.raw_weight(r, v) - (-0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_zero_volatility_is_clamped() {
        let w = RiskProfile::Conservative.raw_weight(0.1, 0.0);
        assert_eq!(w, MAX_INVERSE_VOLATILITY);
        assert!(RiskProfile::Moderate.raw_weight(0.1, 0.0).is_finite());
        assert!(RiskProfile::Balanced.raw_weight(0.1, 0.0).is_finite());
    }

    #[test]
    fn test_quantile_methods() {
        let values = [0.5, 0.1];
        assert_eq!(quantile(&values, 0.9, QuantileMethod::NearestRank), Some(0.5));
        let linear = quantile(&values, 0.9, QuantileMethod::Linear).unwrap();
        assert!((linear - 0.46).abs() < 1e-12);
        assert_eq!(quantile(&[], 0.9, QuantileMethod::Linear), None);
        assert_eq!(quantile(&[0.3], 0.9, QuantileMethod::NearestRank), Some(0.3));
    }

    #[test]
    fn test_exclusion_set_matches_threshold_for_all_profiles() {
        let data = ten_symbols();
        let refs: Vec<&SymbolStats> = data.iter().collect();
        let vols: Vec<f64> = data.iter().map(|s| s.volatility).collect();

        for method in [QuantileMethod::NearestRank, QuantileMethod::Linear] {
            let threshold = quantile(&vols, EXCLUSION_QUANTILE, method).unwrap();
            for profile in RiskProfile::ALL {
                let weights = calculate_weights(&refs, profile, method);
                for s in &data {
                    let w = weights[&s.symbol];
                    if s.volatility > threshold {
                        assert_eq!(w, 0.0, "{} should be excluded under {}", s.symbol, profile);
                    } else {
                        assert_eq!(w, profile.raw_weight(s.average_return, s.volatility));
                    }
                }
            }
        }
    }

    #[test]
    fn test_symbol_at_threshold_is_kept() {
        // Nearest rank over 10 values picks the 9th smallest; that symbol stays.
        let data = ten_symbols();
        let refs: Vec<&SymbolStats> = data.iter().collect();
        let weights = calculate_weights(&refs, RiskProfile::Conservative, QuantileMethod::NearestRank);
        assert!(weights["S8"] > 0.0);
        assert_eq!(weights["S9"], 0.0);
    }

    #[test]
    fn test_two_symbols_nothing_excluded_with_nearest_rank() {
        let a = stats("A", 0.1, 0.08);
        let b = stats("B", 0.5, 0.2);
        let weights = calculate_weights(&[&a, &b], RiskProfile::Conservative, QuantileMethod::NearestRank);
        let normalized = normalize_weights(&weights).unwrap();
        assert!((normalized["A"] - 10.0 / 12.0).abs() < 1e-9);
        assert!((normalized["B"] - 2.0 / 12.0).abs() < 1e-9);

        let linear = calculate_weights(&[&a, &b], RiskProfile::Conservative, QuantileMethod::Linear);
        assert_eq!(linear["B"], 0.0);
    }

    #[test]
    fn test_normalized_weights_sum_to_one() {
        let data = ten_symbols();
        let refs: Vec<&SymbolStats> = data.iter().collect();
        for profile in RiskProfile::ALL {
            let raw = calculate_weights(&refs, profile, QuantileMethod::NearestRank);
            if let Some(normalized) = normalize_weights(&raw) {
                let sum: f64 = normalized.values().sum();
                assert!((sum - 1.0).abs() < 1e-9, "{} weights sum to {}", profile, sum);
                assert!(normalized.values().all(|&w| w >= 0.0));
            }
        }
    }

    #[test]
    fn test_normalize_all_non_positive_is_none() {
        let raw: BTreeMap<String, f64> =
            [("A".to_string(), 0.0), ("B".to_string(), -0.3)].into_iter().collect();
        assert!(normalize_weights(&raw).is_none());
        assert!(normalize_weights(&BTreeMap::new()).is_none());
    }
}
