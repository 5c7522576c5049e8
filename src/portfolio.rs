use crate::config::{RebalanceConfig, MAX_ORDER_QUANTITY};
use crate::data::{MarketDataProvider, MarketSnapshot, SymbolStats};
use crate::error::RebalanceError;
use crate::profile::{calculate_weights, normalize_weights, RiskProfile};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub symbol: String,
}

/// A holding, or a quantity delta produced by the planners.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: u64,
}

impl Position {
    pub fn new(symbol: &str, quantity: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
}

/// Proposed trade. `investment` is the cash amount moved, always >= 0; the
/// action gives its direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub symbol: String,
    pub action: Action,
    pub quantity: u64,
    pub investment: f64,
}

/// Input document, as uploaded by the investor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub investment_amount: f64,
    pub risk_profile: String,
    #[serde(default)]
    pub available_assets: Vec<AssetRef>,
    #[serde(default)]
    pub current_portfolio: Vec<Position>,
}

/// Request after boundary validation: parsed profile, upper-cased and
/// de-duplicated symbols.
#[derive(Clone, Debug)]
pub struct ValidatedRequest {
    pub investment_amount: f64,
    pub profile: RiskProfile,
    pub symbols: Vec<String>,
    pub current_portfolio: Vec<Position>,
}

impl AllocationRequest {
    pub fn validate(&self) -> Result<ValidatedRequest, RebalanceError> {
        let profile: RiskProfile = self.risk_profile.parse()?;

        if !self.investment_amount.is_finite() || self.investment_amount < 0.0 {
            return Err(RebalanceError::InvalidRequest(format!(
                "investment_amount must be a finite number >= 0, got {}",
                self.investment_amount
            )));
        }

        let mut seen = BTreeSet::new();
        let mut symbols = Vec::with_capacity(self.available_assets.len());
        for asset in &self.available_assets {
            let symbol = normalize_symbol(&asset.symbol)?;
            if seen.insert(symbol.clone()) {
                symbols.push(symbol);
            }
        }

        let current_portfolio = self
            .current_portfolio
            .iter()
            .map(|p| Ok(Position::new(&normalize_symbol(&p.symbol)?, p.quantity)))
            .collect::<Result<Vec<_>, RebalanceError>>()?;

        Ok(ValidatedRequest {
            investment_amount: self.investment_amount,
            profile,
            symbols,
            current_portfolio,
        })
    }
}

fn normalize_symbol(raw: &str) -> Result<String, RebalanceError> {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(RebalanceError::InvalidRequest("empty symbol".to_string()));
    }
    Ok(symbol)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioStatistics {
    pub total_investment: f64,
    pub allocation_percent: BTreeMap<String, f64>,
    pub expected_return: Option<f64>,
    pub expected_volatility: Option<f64>,
}

/// Output document of one rebalance pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub initial_portfolio: Vec<Position>,
    pub sell_operations: Vec<Operation>,
    pub buy_operations: Vec<Operation>,
    pub final_portfolio: Vec<Position>,
    pub cash_remaining: f64,
    pub statistics: PortfolioStatistics,
}

/// How liquidated positions take part in the final merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Sold positions are removed before merging with the buys.
    #[default]
    ExcludeLiquidated,
    /// The original holdings table, sold rows included, is merged with the buys.
    RetainOriginal,
}

impl MergePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExcludeLiquidated => "exclude-liquidated",
            Self::RetainOriginal => "retain-original",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exclude-liquidated" | "exclude_liquidated" | "exclude" => {
                Some(Self::ExcludeLiquidated)
            }
            "retain-original" | "retain_original" | "retain" => Some(Self::RetainOriginal),
            _ => None,
        }
    }
}

/// Rounds a money amount to cents, half away from zero. Never returns -0.0.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0 + 0.0
}

// ──────────────────────────────────────────────────────────────────────────────
// Liquidation Selector
// ──────────────────────────────────────────────────────────────────────────────

/// Splits current positions into (keep, unsuitable).
///
/// A position is unsuitable when its symbol is not available, or when it is
/// available and its raw profile weight is exactly zero. Available symbols
/// without market data have no weight and are kept.
pub fn select_liquidations(
    positions: &[Position],
    available: &BTreeSet<String>,
    raw_weights: &BTreeMap<String, f64>,
) -> (Vec<Position>, Vec<Position>) {
    let mut keep = Vec::new();
    let mut unsuitable = Vec::new();

    for position in positions {
        if !available.contains(&position.symbol) {
            debug!("{}: not in available assets, liquidating", position.symbol);
            unsuitable.push(position.clone());
            continue;
        }
        match raw_weights.get(&position.symbol) {
            Some(&w) if w == 0.0 => {
                debug!("{}: zero weight under profile, liquidating", position.symbol);
                unsuitable.push(position.clone());
            }
            Some(_) => keep.push(position.clone()),
            None => {
                warn!("{}: no market data, keeping position as is", position.symbol);
                keep.push(position.clone());
            }
        }
    }

    (keep, unsuitable)
}

// ──────────────────────────────────────────────────────────────────────────────
// Sell Planner
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct SellPlan {
    pub operations: Vec<Operation>,
    pub proceeds: f64,
}

/// Resolves a price for every unsuitable position: snapshot price first, then
/// a bounded single-symbol lookup, then 0.
pub async fn resolve_sell_prices<P: MarketDataProvider>(
    unsuitable: &[Position],
    snapshot: &MarketSnapshot,
    provider: &P,
    timeout: Duration,
) -> BTreeMap<String, f64> {
    let mut prices = BTreeMap::new();

    for position in unsuitable {
        if prices.contains_key(&position.symbol) {
            continue;
        }
        let price = match snapshot.price(&position.symbol) {
            Some(price) => price,
            None => {
                let lookup = provider.fetch_latest_price(&position.symbol);
                match tokio::time::timeout(timeout, lookup).await {
                    Ok(Ok(price)) if price.is_finite() && price >= 0.0 => {
                        info!("{}: fallback price {:.2}", position.symbol, price);
                        price
                    }
                    Ok(Ok(price)) => {
                        warn!(
                            "{}: fallback returned invalid price {}, selling at 0",
                            position.symbol, price
                        );
                        0.0
                    }
                    Ok(Err(e)) => {
                        warn!(
                            "{}: fallback price lookup failed ({}), selling at 0",
                            position.symbol, e
                        );
                        0.0
                    }
                    Err(_) => {
                        warn!(
                            "{}: fallback price lookup timed out after {:?}, selling at 0",
                            position.symbol, timeout
                        );
                        0.0
                    }
                }
            }
        };
        prices.insert(position.symbol.clone(), price);
    }

    prices
}

/// Emits one sell per unsuitable position with a nonzero quantity.
pub fn plan_sells(unsuitable: &[Position], prices: &BTreeMap<String, f64>) -> SellPlan {
    let mut operations = Vec::with_capacity(unsuitable.len());
    let mut proceeds = 0.0;

    for position in unsuitable.iter().filter(|p| p.quantity > 0) {
        let price = prices.get(&position.symbol).copied().unwrap_or(0.0);
        let investment = round2(position.quantity as f64 * price);
        proceeds += investment;
        operations.push(Operation {
            symbol: position.symbol.clone(),
            action: Action::Sell,
            quantity: position.quantity,
            investment,
        });
    }

    SellPlan { operations, proceeds }
}

// ──────────────────────────────────────────────────────────────────────────────
// Buy Planner
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct BuyPlan {
    pub operations: Vec<Operation>,
    pub cash_remaining: f64,
}

/// Turns cash into whole-share buys following `weights`.
///
/// Every symbol with a weight gets an operation, zero quantities included.
/// With no weights (`None`) the whole amount stays in cash.
pub fn plan_buys(
    symbols: &[String],
    weights: Option<&BTreeMap<String, f64>>,
    snapshot: &MarketSnapshot,
    total_cash: f64,
) -> BuyPlan {
    let Some(weights) = weights else {
        return BuyPlan {
            operations: Vec::new(),
            cash_remaining: round2(total_cash),
        };
    };

    let mut operations = Vec::with_capacity(symbols.len());
    let mut cash_spent = 0.0;

    for symbol in symbols {
        let (Some(&weight), Some(price)) = (weights.get(symbol), snapshot.price(symbol)) else {
            continue;
        };
        let allocation = total_cash * weight;
        let quantity = affordable_quantity(allocation, price);
        let investment = round2(quantity as f64 * price);
        cash_spent += investment;
        operations.push(Operation {
            symbol: symbol.clone(),
            action: Action::Buy,
            quantity,
            investment,
        });
    }

    BuyPlan {
        operations,
        cash_remaining: round2(total_cash - cash_spent),
    }
}

/// Whole shares purchasable with `allocation`, capped at `MAX_ORDER_QUANTITY`;
/// the rounded cost never exceeds it.
fn affordable_quantity(allocation: f64, price: f64) -> u64 {
    if price <= 0.0 || allocation <= 0.0 {
        return 0;
    }
    let shares = (allocation / price).floor();
    let mut quantity = if shares >= MAX_ORDER_QUANTITY as f64 {
        MAX_ORDER_QUANTITY
    } else {
        shares as u64
    };
    while quantity > 0 && round2(quantity as f64 * price) > allocation {
        quantity -= 1;
    }
    quantity
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio Merger
// ──────────────────────────────────────────────────────────────────────────────

/// Adds buy quantities onto `base`, dropping empty rows. Sorted by symbol.
pub fn merge_portfolio(base: &[Position], buys: &[Operation]) -> Vec<Position> {
    let mut merged: BTreeMap<String, u64> = BTreeMap::new();

    for position in base {
        let held = merged.entry(position.symbol.clone()).or_default();
        *held = held.saturating_add(position.quantity);
    }
    for op in buys.iter().filter(|op| op.action == Action::Buy) {
        let held = merged.entry(op.symbol.clone()).or_default();
        *held = held.saturating_add(op.quantity);
    }

    merged
        .into_iter()
        .filter(|(_, quantity)| *quantity > 0)
        .map(|(symbol, quantity)| Position { symbol, quantity })
        .collect()
}

// ──────────────────────────────────────────────────────────────────────────────
// Statistics Summarizer
// ──────────────────────────────────────────────────────────────────────────────

/// Value-weighted statistics of the final holdings, priced from `snapshot`.
/// Holdings without snapshot data are left out.
pub fn summarize(final_portfolio: &[Position], snapshot: &MarketSnapshot) -> PortfolioStatistics {
    let priced: Vec<(&SymbolStats, f64)> = final_portfolio
        .iter()
        .filter_map(|p| {
            let stats = snapshot.get(&p.symbol);
            if stats.is_none() {
                debug!("{}: no market data, left out of statistics", p.symbol);
            }
            stats.map(|s| (s, p.quantity as f64 * s.price))
        })
        .collect();

    let total: f64 = priced.iter().map(|(_, value)| value).sum();
    if total <= 0.0 {
        return PortfolioStatistics {
            total_investment: 0.0,
            allocation_percent: BTreeMap::new(),
            expected_return: None,
            expected_volatility: None,
        };
    }

    let allocation_percent = priced
        .iter()
        .map(|(s, value)| (s.symbol.clone(), round2(value / total * 100.0)))
        .collect();
    let weighted_return: f64 = priced.iter().map(|(s, v)| v * s.average_return).sum();
    let weighted_vol: f64 = priced.iter().map(|(s, v)| v * s.volatility).sum();

    PortfolioStatistics {
        total_investment: round2(total),
        allocation_percent,
        expected_return: Some(round2(weighted_return / total)),
        expected_volatility: Some(round2(weighted_vol / total)),
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Pipeline
// ──────────────────────────────────────────────────────────────────────────────

/// Full pipeline: validate → fetch statistics → weights → sells → buys →
/// merge → statistics.
pub async fn rebalance<P: MarketDataProvider>(
    request: &AllocationRequest,
    provider: &P,
    cfg: &RebalanceConfig,
) -> Result<AllocationResult> {
    let validated = request.validate()?;
    info!(
        "Rebalancing: profile={}, budget={:.2}, assets={}, positions={}",
        validated.profile,
        validated.investment_amount,
        validated.symbols.len(),
        validated.current_portfolio.len()
    );

    let snapshot = provider.fetch(&validated.symbols).await?;
    if snapshot.is_empty() && !validated.symbols.is_empty() {
        warn!("No market data for any available asset");
    }
    for symbol in validated.symbols.iter().filter(|s| !snapshot.contains(s)) {
        warn!("{}: no market data, excluded from weighting and buying", symbol);
    }

    Ok(rebalance_with_snapshot(request, &validated, &snapshot, provider, cfg).await)
}

/// Runs the allocation against an already fetched snapshot. The provider is
/// only consulted for off-snapshot sell prices.
pub async fn rebalance_with_snapshot<P: MarketDataProvider>(
    request: &AllocationRequest,
    validated: &ValidatedRequest,
    snapshot: &MarketSnapshot,
    provider: &P,
    cfg: &RebalanceConfig,
) -> AllocationResult {
    let considered: Vec<&SymbolStats> = validated
        .symbols
        .iter()
        .filter_map(|s| snapshot.get(s))
        .collect();
    let raw_weights = calculate_weights(&considered, validated.profile, cfg.quantile_method);
    let weights = normalize_weights(&raw_weights);
    if weights.is_none() {
        warn!(
            "No eligible symbols after risk filtering for profile {}; keeping all cash",
            validated.profile
        );
    }

    let available: BTreeSet<String> = validated.symbols.iter().cloned().collect();
    let (keep, unsuitable) =
        select_liquidations(&validated.current_portfolio, &available, &raw_weights);

    let prices = resolve_sell_prices(&unsuitable, snapshot, provider, cfg.provider_timeout).await;
    let sells = plan_sells(&unsuitable, &prices);

    let total_cash = validated.investment_amount + sells.proceeds;
    info!(
        "Cash available: {:.2} (budget {:.2} + sales {:.2})",
        total_cash, validated.investment_amount, sells.proceeds
    );
    let buys = plan_buys(&validated.symbols, weights.as_ref(), snapshot, total_cash);

    let base = match cfg.merge_policy {
        MergePolicy::ExcludeLiquidated => keep.as_slice(),
        MergePolicy::RetainOriginal => validated.current_portfolio.as_slice(),
    };
    let final_portfolio = merge_portfolio(base, &buys.operations);
    let statistics = summarize(&final_portfolio, snapshot);

    info!(
        "Proposal: {} sells, {} buys, {} final positions, cash remaining {:.2}",
        sells.operations.len(),
        buys.operations.iter().filter(|op| op.quantity > 0).count(),
        final_portfolio.len(),
        buys.cash_remaining
    );

    AllocationResult {
        initial_portfolio: request.current_portfolio.clone(),
        sell_operations: sells.operations,
        buy_operations: buys.operations,
        final_portfolio,
        cash_remaining: buys.cash_remaining,
        statistics,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
