use std::path::Path;

use bazaar_engine::{Caller, MarketConfig, RunAllReport, SettlementRun};
use bazaar_storage::UserId;
use time::format_description::well_known::Rfc3339;

use super::print_json;
use crate::ledger::{period, LedgerSession};
use crate::{OutputFormat, PeriodArgs};

pub(crate) async fn cmd_settle(
    ledger: &Path,
    seller: UserId,
    period_args: &PeriodArgs,
    config: MarketConfig,
    output: OutputFormat,
) -> Result<(), String> {
    let session = LedgerSession::open(ledger, config).await?;
    let run = session
        .market()
        .settlement()
        .run(&Caller::system(), seller, period(period_args))
        .await
        .map_err(|e| e.to_string());
    let saved = session.save();
    session.close().await;
    let run = run?;
    saved?;
    match output {
        OutputFormat::Json => print_json(&run),
        OutputFormat::Text => {
            print!("{}", render_run(&run));
            Ok(())
        }
    }
}

pub(crate) async fn cmd_settle_all(
    ledger: &Path,
    period_args: &PeriodArgs,
    config: MarketConfig,
    output: OutputFormat,
) -> Result<(), String> {
    let session = LedgerSession::open(ledger, config).await?;
    let report = session
        .market()
        .settlement()
        .run_all(&Caller::system(), period(period_args))
        .await
        .map_err(|e| e.to_string());
    let saved = session.save();
    session.close().await;
    let report = report?;
    saved?;
    match output {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print!("{}", render_report(&report)),
    }
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} settlement(s) failed", report.failed.len()))
    }
}

fn stamp(at: time::OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

pub(super) fn render_run(run: &SettlementRun) -> String {
    let s = &run.settlement;
    let mut out = String::new();
    out.push_str(&format!("settlement {}\n", s.id));
    out.push_str(&format!("  seller:        {}\n", s.seller_id));
    out.push_str(&format!(
        "  period:        {} .. {}\n",
        stamp(s.period.start),
        stamp(s.period.end)
    ));
    out.push_str(&format!("  total:         {} {}\n", s.total_amount, s.currency));
    out.push_str(&format!("  platform fee:  {}\n", s.platform_fee));
    out.push_str(&format!("  verification:  {}\n", s.verification_earnings));
    out.push_str(&format!("  payout:        {}\n", s.payout_amount));
    out.push_str(&format!("  status:        {}\n", s.status.as_str()));
    if !run.items.is_empty() {
        out.push_str("  items:\n");
        for item in &run.items {
            out.push_str(&format!(
                "    {} orders={} amount={} fee={} payout={}\n",
                item.product_id, item.order_count, item.amount, item.platform_fee, item.payout_amount
            ));
        }
    }
    out
}

fn render_report(report: &RunAllReport) -> String {
    let mut out = String::new();
    for run in &report.settled {
        out.push_str(&render_run(run));
    }
    for seller in &report.skipped {
        out.push_str(&format!("skipped {seller}: period already settled\n"));
    }
    for (seller, reason) in &report.failed {
        out.push_str(&format!("failed {seller}: {reason}\n"));
    }
    out.push_str(&format!(
        "{} settled, {} skipped, {} failed\n",
        report.settled.len(),
        report.skipped.len(),
        report.failed.len()
    ));
    out
}
