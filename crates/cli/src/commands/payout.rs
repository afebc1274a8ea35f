use std::path::Path;
use std::sync::Arc;

use bazaar_engine::{Caller, MarketConfig, RetryPolicy, SettlementRun};
use bazaar_storage::UserId;

use super::print_json;
use super::settle::render_run;
use crate::http_payout::HttpPayoutProvider;
use crate::ledger::{period, LedgerSession};
use crate::{OutputFormat, PeriodArgs};

pub(crate) struct PayoutOptions<'a> {
    pub(crate) ledger: &'a Path,
    pub(crate) seller: UserId,
    pub(crate) period: &'a PeriodArgs,
    pub(crate) endpoint: String,
    pub(crate) api_key: Option<String>,
}

/// Settle the period (or pick up the settlement a previous run left in the
/// ledger) and dispatch it. The ledger is saved before the transfer and
/// again after it, whatever the outcome, so a re-run reuses the same
/// settlement id and therefore the same idempotency key.
pub(crate) async fn cmd_payout(
    opts: PayoutOptions<'_>,
    config: MarketConfig,
    output: OutputFormat,
) -> Result<(), String> {
    let retry = config.payout_retry;
    let session = LedgerSession::open(opts.ledger, config).await?;
    let outcome = pay(&session, &opts, retry).await;
    let saved = session.save();
    session.close().await;
    let run = outcome?;
    saved?;

    match output {
        OutputFormat::Json => print_json(&run.settlement),
        OutputFormat::Text => {
            print!("{}", render_run(&run));
            if let Some(ref transfer) = run.settlement.transfer_id {
                println!("  transfer:      {}", transfer);
            }
            Ok(())
        }
    }
}

async fn pay(
    session: &LedgerSession,
    opts: &PayoutOptions<'_>,
    retry: RetryPolicy,
) -> Result<SettlementRun, String> {
    let market = session.market();
    let caller = Caller::system();
    let period = period(opts.period);
    let existing = market
        .settlement()
        .find(opts.seller, period)
        .await
        .map_err(|e| e.to_string())?;
    let mut run = match existing {
        Some(run) => {
            tracing::info!(
                settlement_id = %run.settlement.id,
                status = run.settlement.status.as_str(),
                "resuming settlement from ledger"
            );
            run
        }
        None => {
            let run = market
                .settlement()
                .run(&caller, opts.seller, period)
                .await
                .map_err(|e| e.to_string())?;
            session.save()?;
            run
        }
    };

    let provider = Arc::new(HttpPayoutProvider::new(
        opts.endpoint.clone(),
        opts.api_key.clone(),
    ));
    run.settlement = market
        .payouts(provider)
        .dispatch_with_retry(&caller, run.settlement.id, &retry)
        .await
        .map_err(|e| e.to_string())?;
    Ok(run)
}
