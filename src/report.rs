use crate::portfolio::{AllocationResult, Operation};
use crate::profile::RiskProfile;
use anyhow::{anyhow, Result};
use std::path::Path;
use tracing::info;

/// Serializes the proposal as pretty JSON to `path`, or stdout when `None`.
pub fn write_result_json(result: &AllocationResult, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    match path {
        Some(path) => {
            std::fs::write(path, json)
                .map_err(|e| anyhow!("Failed to write {}: {}", path.display(), e))?;
            info!("Proposal written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Renders the proposal as a boxed text table.
pub fn render_summary(result: &AllocationResult, profile: RiskProfile) -> String {
    let mut out = String::new();
    let line = |out: &mut String, text: String| {
        out.push_str(&format!("║ {:<58} ║\n", text));
    };
    let rule = "╠════════════════════════════════════════════════════════════╣\n";

    out.push_str("╔════════════════════════════════════════════════════════════╗\n");
    line(&mut out, format!("Rebalancing Proposal ({})", profile));
    out.push_str(rule);

    line(&mut out, "Sell Operations".to_string());
    if result.sell_operations.is_empty() {
        line(&mut out, "  (none)".to_string());
    }
    for op in &result.sell_operations {
        line(&mut out, operation_row(op));
    }

    out.push_str(rule);
    line(&mut out, "Buy Operations".to_string());
    let buys: Vec<&Operation> = result.buy_operations.iter().filter(|op| op.quantity > 0).collect();
    if buys.is_empty() {
        line(&mut out, "  (none)".to_string());
    }
    for op in buys {
        line(&mut out, operation_row(op));
    }

    out.push_str(rule);
    line(&mut out, "Symbol     Quantity   Allocation".to_string());
    for position in &result.final_portfolio {
        let pct = result
            .statistics
            .allocation_percent
            .get(&position.symbol)
            .map(|p| format!("{:>7.2}%", p))
            .unwrap_or_else(|| "     n/a".to_string());
        line(&mut out, format!("{:<8} {:>10}   {}", position.symbol, position.quantity, pct));
    }

    out.push_str(rule);
    let stats = &result.statistics;
    line(&mut out, format!("Total Invested      : ${:>12.2}", stats.total_investment));
    line(&mut out, format!("Cash Remaining      : ${:>12.2}", result.cash_remaining));
    line(&mut out, format!("Expected Return     : {}", optional_pct(stats.expected_return)));
    line(&mut out, format!("Expected Volatility : {}", optional_pct(stats.expected_volatility)));
    out.push_str("╚════════════════════════════════════════════════════════════╝\n");
    out
}

pub fn print_summary(result: &AllocationResult, profile: RiskProfile) {
    eprintln!("{}", render_summary(result, profile));
    eprintln!("⚠  Educational use only. Not financial advice.");
}

pub fn print_profiles() {
    println!("Supported risk profiles:");
    for profile in RiskProfile::ALL {
        println!("  {:<13} {}", profile.as_str(), profile.description());
    }
}

fn operation_row(op: &Operation) -> String {
    format!("  {:<6} x{:<8} ${:>12.2}", op.symbol, op.quantity, op.investment)
}

fn optional_pct(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:>+7.2}%", v * 100.0),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::{Action, PortfolioStatistics, Position};
    use std::collections::BTreeMap;

    fn sample_result() -> AllocationResult {
        AllocationResult {
            initial_portfolio: vec![Position::new("OLD", 2)],
            sell_operations: vec![Operation {
                symbol: "OLD".into(),
                action: Action::Sell,
                quantity: 2,
                investment: 40.0,
            }],
            buy_operations: vec![
                Operation { symbol: "A".into(), action: Action::Buy, quantity: 1, investment: 30.0 },
                Operation { symbol: "B".into(), action: Action::Buy, quantity: 0, investment: 0.0 },
            ],
            final_portfolio: vec![Position::new("A", 1)],
            cash_remaining: 10.0,
            statistics: PortfolioStatistics {
                total_investment: 30.0,
                allocation_percent: BTreeMap::from([("A".to_string(), 100.0)]),
                expected_return: Some(0.12),
                expected_volatility: None,
            },
        }
    }

    #[test]
    fn test_summary_lists_only_nonzero_buys() {
        let text = render_summary(&sample_result(), RiskProfile::Growth);
        assert!(text.contains("Rebalancing Proposal (growth)"));
        assert!(text.contains("OLD"));
        assert!(!text.contains("  B "));
        assert!(text.contains("+12.00%"));
        assert!(text.contains("n/a"));
    }

    #[test]
    fn test_json_uses_wire_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_result_json(&sample_result(), Some(&path)).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["sell_operations"][0]["action"], "sell");
        assert_eq!(value["buy_operations"][0]["action"], "buy");
        assert_eq!(value["statistics"]["allocation_percent"]["A"], 100.0);
        assert!(value["statistics"]["expected_volatility"].is_null());
        assert_eq!(value["cash_remaining"], 10.0);
    }
}
