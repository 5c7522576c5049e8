use crate::config::{RebalanceConfig, TRADING_DAYS};
use crate::error::RebalanceError;
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Market Statistics
// ──────────────────────────────────────────────────────────────────────────────

/// Annualized statistics for one tradeable symbol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub price: f64,
    pub average_return: f64,
    pub volatility: f64,
}

impl SymbolStats {
    fn validate(&self) -> Result<(), RebalanceError> {
        let invalid = |reason: &str| RebalanceError::InvalidSnapshot {
            symbol: self.symbol.clone(),
            reason: reason.to_string(),
        };
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(invalid("price must be finite and >= 0"));
        }
        if !self.volatility.is_finite() || self.volatility < 0.0 {
            return Err(invalid("volatility must be finite and >= 0"));
        }
        if !self.average_return.is_finite() {
            return Err(invalid("average return must be finite"));
        }
        Ok(())
    }
}

/// Statistics for the symbols of one request, keyed by symbol.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarketSnapshot {
    stats: BTreeMap<String, SymbolStats>,
}

impl MarketSnapshot {
    pub fn from_stats(stats: impl IntoIterator<Item = SymbolStats>) -> Result<Self, RebalanceError> {
        let mut snapshot = Self::default();
        for s in stats {
            snapshot.insert(s)?;
        }
        Ok(snapshot)
    }

    pub fn insert(&mut self, stats: SymbolStats) -> Result<(), RebalanceError> {
        stats.validate()?;
        self.stats.insert(stats.symbol.clone(), stats);
        Ok(())
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolStats> {
        self.stats.get(symbol)
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.stats.get(symbol).map(|s| s.price)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.stats.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Restricts the snapshot to `symbols`.
    pub fn subset(&self, symbols: &[String]) -> Self {
        Self {
            stats: symbols
                .iter()
                .filter_map(|s| self.stats.get(s).map(|v| (s.clone(), v.clone())))
                .collect(),
        }
    }
}

/// Source of market statistics for a rebalance run.
#[allow(async_fn_in_trait)]
pub trait MarketDataProvider {
    /// Statistics for every symbol the provider has data for. Symbols without
    /// data are left out of the snapshot rather than failing the call.
    async fn fetch(&self, symbols: &[String]) -> Result<MarketSnapshot>;

    /// Most recent price for a single symbol.
    async fn fetch_latest_price(&self, symbol: &str) -> Result<f64>;
}

// ──────────────────────────────────────────────────────────────────────────────
// Price History
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
#[allow(dead_code)]
pub struct Candle {
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Holds historical stock data for a specific symbol.
#[derive(Clone, Debug)]
pub struct StockData {
    pub symbol: String,
    pub history: Vec<Candle>,
}

impl StockData {
    /// Day-over-day percent change of the close.
    pub fn daily_returns(&self) -> Vec<f64> {
        self.history
            .windows(2)
            .filter(|w| w[0].close > 0.0)
            .map(|w| w[1].close / w[0].close - 1.0)
            .collect()
    }

    /// Annualized mean return and volatility plus the last close.
    pub fn annualized_stats(&self) -> Result<SymbolStats> {
        let returns = self.daily_returns();
        if returns.len() < 2 {
            return Err(anyhow!(
                "{}: insufficient history ({} returns)",
                self.symbol,
                returns.len()
            ));
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let price = self
            .history
            .last()
            .map(|c| c.close)
            .ok_or(anyhow!("{}: empty history", self.symbol))?;

        Ok(SymbolStats {
            symbol: self.symbol.clone(),
            price,
            average_return: mean * TRADING_DAYS,
            volatility: variance.sqrt() * TRADING_DAYS.sqrt(),
        })
    }

    #[cfg(test)]
    pub fn new_mock(symbol: &str, days: usize) -> Self {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut history = Vec::with_capacity(days);
        let mut current_price: f64 = 100.0;
        let mut current_date = Utc::now() - chrono::Duration::days(days as i64);

        for _ in 0..days {
            let volatility = 0.02;
            let change_pct: f64 = rng.gen_range(-volatility..volatility);
            let open = current_price;
            let close = open * (1.0 + change_pct);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
            let volume = rng.gen_range(1000.0..10000.0);

            history.push(Candle { date: current_date, open, high, low, close, volume });

            current_price = close;
            current_date += chrono::Duration::days(1);
        }

        Self {
            symbol: symbol.to_string(),
            history,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Yahoo Finance Provider
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Vec<YahooResult>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

const YAHOO_HOSTS: [&str; 2] = ["query1.finance.yahoo.com", "query2.finance.yahoo.com"];
const MAX_FETCH_ATTEMPTS: usize = 3;

/// Market statistics computed from Yahoo Finance daily candles.
pub struct YahooProvider {
    client: reqwest::Client,
    range: String,
    cache_dir: PathBuf,
    cache_ttl: Duration,
    fetch_delay: Duration,
}

impl YahooProvider {
    pub fn new(cfg: &RebalanceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.provider_timeout)
            .user_agent("Mozilla/5.0")
            .build()?;
        Ok(Self {
            client,
            range: cfg.history_range.clone(),
            cache_dir: cfg.cache_dir.clone(),
            cache_ttl: cfg.cache_ttl,
            fetch_delay: cfg.fetch_delay,
        })
    }

    /// Fetches daily history for `symbol`, served from the on-disk cache while fresh.
    pub async fn fetch_history(&self, symbol: &str) -> Result<StockData> {
        if !self.cache_dir.exists() {
            std::fs::create_dir_all(&self.cache_dir)?;
        }
        let cache_file = self.cache_dir.join(format!("{}_{}.json", symbol, self.range));

        let response = match read_fresh_cache(&cache_file, self.cache_ttl) {
            Some(cached) => {
                info!("Loading {} from cache...", symbol);
                cached
            }
            None => {
                info!("Cache miss for {}, fetching...", symbol);
                self.fetch_from_api(symbol, &cache_file).await?
            }
        };

        chart_to_stock_data(symbol, &response)
    }

    async fn fetch_from_api(&self, symbol: &str, cache_path: &Path) -> Result<YahooChartResponse> {
        let url = format!(
            "https://{}/v8/finance/chart/{}?range={}&interval=1d",
            YAHOO_HOSTS[0], symbol, self.range
        );

        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = match self.client.get(&url).send().await {
                Ok(resp) => resp.json::<YahooChartResponse>().await.map_err(anyhow::Error::from),
                Err(e) => Err(e.into()),
            };

            match outcome {
                Ok(resp_json) => {
                    if let Err(e) = write_cache(cache_path, &resp_json) {
                        warn!("Failed to write cache for {}: {}", symbol, e);
                    }
                    return Ok(resp_json);
                }
                Err(e) => {
                    if attempts >= MAX_FETCH_ATTEMPTS {
                        return Err(e);
                    }
                    warn!(
                        "Failed to fetch data for {} (attempt {}/{}): {}",
                        symbol, attempts, MAX_FETCH_ATTEMPTS, e
                    );
                }
            }

            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

impl MarketDataProvider for YahooProvider {
    async fn fetch(&self, symbols: &[String]) -> Result<MarketSnapshot> {
        let mut snapshot = MarketSnapshot::default();

        for (idx, raw_symbol) in symbols.iter().enumerate() {
            let symbol = raw_symbol.trim().to_uppercase();
            if symbol.is_empty() || snapshot.contains(&symbol) {
                continue;
            }

            let stats = self
                .fetch_history(&symbol)
                .await
                .and_then(|data| data.annualized_stats());
            match stats {
                Ok(stats) => {
                    debug!(
                        "{}: price={:.2}, E[r]={:.4}, σ={:.4}",
                        stats.symbol, stats.price, stats.average_return, stats.volatility
                    );
                    if let Err(e) = snapshot.insert(stats) {
                        warn!("Discarding market data: {}", e);
                    }
                }
                Err(e) => warn!("No market statistics for {}: {}. Skipping.", symbol, e),
            }

            if idx + 1 < symbols.len() && !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
        }

        info!("Market snapshot ready: {}/{} symbols", snapshot.len(), symbols.len());
        Ok(snapshot)
    }

    /// Latest 1-minute close from Yahoo, trying both query hosts.
    async fn fetch_latest_price(&self, symbol: &str) -> Result<f64> {
        let mut last_error: Option<anyhow::Error> = None;

        for host in YAHOO_HOSTS {
            let url = format!(
                "https://{}/v8/finance/chart/{}?interval=1m&range=1d",
                host, symbol
            );
            let parsed = match self.client.get(&url).send().await {
                Ok(resp) => resp.json::<YahooChartResponse>().await,
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };

            match parsed {
                Ok(parsed) => match latest_close(&parsed) {
                    Some(price) => return Ok(price),
                    None => last_error = Some(anyhow!("No valid 1m close for {}", symbol)),
                },
                Err(e) => last_error = Some(e.into()),
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Failed to fetch latest price for {}", symbol)))
    }
}

fn read_fresh_cache(path: &Path, ttl: Duration) -> Option<YahooChartResponse> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let age = std::time::SystemTime::now().duration_since(modified).ok()?;
    if age > ttl {
        debug!("Cache expired: {}", path.display());
        return None;
    }
    let file = std::fs::File::open(path).ok()?;
    serde_json::from_reader(std::io::BufReader::new(file)).ok()
}

fn write_cache(path: &Path, response: &YahooChartResponse) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer(std::io::BufWriter::new(file), response)?;
    Ok(())
}

fn latest_close(response: &YahooChartResponse) -> Option<f64> {
    response
        .chart
        .result
        .first()?
        .indicators
        .quote
        .first()?
        .close
        .iter()
        .rev()
        .find_map(|value| *value)
}

fn chart_to_stock_data(symbol: &str, response: &YahooChartResponse) -> Result<StockData> {
    let result = response
        .chart
        .result
        .first()
        .ok_or(anyhow!("No data found for {}", symbol))?;
    let quotes = result
        .indicators
        .quote
        .first()
        .ok_or(anyhow!("No quote result for {}", symbol))?;

    let mut history = Vec::with_capacity(result.timestamp.len());
    for (i, &timestamp) in result.timestamp.iter().enumerate() {
        let field = |v: &Vec<Option<f64>>| v.get(i).copied().flatten();
        let (Some(close), Some(date)) =
            (field(&quotes.close), Utc.timestamp_opt(timestamp, 0).single())
        else {
            continue;
        };
        history.push(Candle {
            date,
            open: field(&quotes.open).unwrap_or(close),
            high: field(&quotes.high).unwrap_or(close),
            low: field(&quotes.low).unwrap_or(close),
            close,
            volume: field(&quotes.volume).unwrap_or(0.0),
        });
    }

    Ok(StockData {
        symbol: symbol.to_uppercase(),
        history,
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Static Snapshot Provider
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotFile {
    #[serde(default)]
    pub symbols: BTreeMap<String, SnapshotEntry>,
    #[serde(default)]
    pub latest_prices: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub price: f64,
    pub average_return: f64,
    pub volatility: f64,
}

/// Provider backed by a fixed set of statistics, e.g. loaded from a JSON file.
///
/// `latest_prices` answers single-symbol lookups for symbols outside the
/// statistics table.
#[derive(Clone, Debug, Default)]
pub struct SnapshotProvider {
    snapshot: MarketSnapshot,
    latest_prices: BTreeMap<String, f64>,
}

impl SnapshotProvider {
    pub fn new(snapshot: MarketSnapshot) -> Self {
        Self {
            snapshot,
            latest_prices: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with_latest_price(mut self, symbol: &str, price: f64) -> Self {
        self.latest_prices.insert(symbol.to_uppercase(), price);
        self
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read snapshot {}: {}", path.display(), e))?;
        let file: SnapshotFile = serde_json::from_str(&text)
            .map_err(|e| anyhow!("Invalid snapshot {}: {}", path.display(), e))?;

        let snapshot = MarketSnapshot::from_stats(file.symbols.into_iter().map(|(symbol, e)| {
            SymbolStats {
                symbol: symbol.trim().to_uppercase(),
                price: e.price,
                average_return: e.average_return,
                volatility: e.volatility,
            }
        }))?;
        info!("Loaded snapshot {} with {} symbols", path.display(), snapshot.len());

        let mut provider = Self::new(snapshot);
        provider.latest_prices = file
            .latest_prices
            .into_iter()
            .map(|(s, p)| (s.trim().to_uppercase(), p))
            .collect();
        Ok(provider)
    }
}

impl MarketDataProvider for SnapshotProvider {
    async fn fetch(&self, symbols: &[String]) -> Result<MarketSnapshot> {
        Ok(self.snapshot.subset(symbols))
    }

    async fn fetch_latest_price(&self, symbol: &str) -> Result<f64> {
        self.latest_prices
            .get(symbol)
            .or_else(|| self.snapshot.get(symbol).map(|s| &s.price))
            .copied()
            .ok_or(anyhow!("No price available for {}", symbol))
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn history_from_closes(symbol: &str, closes: &[f64]) -> StockData {
        let start = Utc::now() - ChronoDuration::days(closes.len() as i64);
        StockData {
            symbol: symbol.to_string(),
            history: closes
                .iter()
                .enumerate()
                .map(|(i, &close)| Candle {
                    date: start + ChronoDuration::days(i as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1000.0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_annualized_stats_from_known_closes() {
        let data = history_from_closes("TEST", &[100.0, 110.0, 99.0, 108.9]);
        let stats = data.annualized_stats().unwrap();

        // Returns: +10%, -10%, +10%
        let mean = 0.1 / 3.0;
        let var = ((0.1f64 - mean).powi(2) * 2.0 + (-0.1f64 - mean).powi(2)) / 2.0;
        assert!((stats.average_return - mean * 252.0).abs() < 1e-9);
        assert!((stats.volatility - var.sqrt() * 252f64.sqrt()).abs() < 1e-9);
        assert_eq!(stats.price, 108.9);
    }

    #[test]
    fn test_annualized_stats_needs_history() {
        let data = history_from_closes("THIN", &[100.0, 101.0]);
        assert!(data.annualized_stats().is_err());
    }

    #[test]
    fn test_mock_history_produces_sane_stats() {
        let data = StockData::new_mock("MOCK", 252);
        let stats = data.annualized_stats().unwrap();
        assert!(stats.volatility > 0.0);
        assert!(stats.price > 0.0);
        assert_eq!(data.daily_returns().len(), 251);
    }

    #[test]
    fn test_snapshot_rejects_negative_price() {
        let bad = SymbolStats {
            symbol: "BAD".to_string(),
            price: -1.0,
            average_return: 0.1,
            volatility: 0.2,
        };
        assert!(matches!(
            MarketSnapshot::from_stats([bad]),
            Err(RebalanceError::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn test_chart_parsing_skips_null_rows() {
        let response: YahooChartResponse = serde_json::from_value(serde_json::json!({
            "chart": { "result": [{
                "timestamp": [1700000000, 1700086400, 1700172800],
                "indicators": { "quote": [{
                    "open":   [1.0, 2.0, 3.0],
                    "high":   [1.0, 2.0, 3.0],
                    "low":    [1.0, 2.0, 3.0],
                    "close":  [1.0, null, 3.0],
                    "volume": [10.0, 20.0, 30.0]
                }]}
            }]}
        }))
        .unwrap();

        let data = chart_to_stock_data("abc", &response).unwrap();
        assert_eq!(data.symbol, "ABC");
        assert_eq!(data.history.len(), 2);
        assert_eq!(latest_close(&response), Some(3.0));
    }

    #[test]
    fn test_chart_parsing_keeps_close_without_ohlcv() {
        let response: YahooChartResponse = serde_json::from_value(serde_json::json!({
            "chart": { "result": [{
                "timestamp": [1700000000, 1700086400, 1700172800],
                "indicators": { "quote": [{
                    "open":   [1.0, null, 3.0],
                    "high":   [null, 2.0, 3.0],
                    "low":    [1.0, 2.0, null],
                    "close":  [1.0, 2.0, 3.0],
                    "volume": [10.0, null, 30.0]
                }]}
            }]}
        }))
        .unwrap();

        let data = chart_to_stock_data("abc", &response).unwrap();
        assert_eq!(data.history.len(), 3);
        assert_eq!(data.history[1].open, 2.0);
        assert_eq!(data.history[1].volume, 0.0);
        assert_eq!(data.daily_returns(), vec![1.0, 0.5]);
    }

    #[tokio::test]
    async fn test_snapshot_provider_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(
            &path,
            r#"{
                "symbols": { "aaa": { "price": 10.0, "average_return": 0.1, "volatility": 0.2 } },
                "latest_prices": { "old": 4.5 }
            }"#,
        )
        .unwrap();

        let provider = SnapshotProvider::from_file(&path).unwrap();
        let snapshot = provider
            .fetch(&["AAA".to_string(), "MISSING".to_string()])
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.price("AAA"), Some(10.0));
        assert_eq!(provider.fetch_latest_price("OLD").await.unwrap(), 4.5);
        assert_eq!(provider.fetch_latest_price("AAA").await.unwrap(), 10.0);
        assert!(provider.fetch_latest_price("NONE").await.is_err());
    }

    #[test]
    fn test_fresh_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X_1y.json");
        let response: YahooChartResponse = serde_json::from_value(serde_json::json!({
            "chart": { "result": [] }
        }))
        .unwrap();
        write_cache(&path, &response).unwrap();

        assert!(read_fresh_cache(&path, Duration::from_secs(60)).is_some());
        assert!(read_fresh_cache(&dir.path().join("missing.json"), Duration::from_secs(60)).is_none());
    }
}
