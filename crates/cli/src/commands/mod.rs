mod config;
mod payout;
mod quote;
mod settle;

pub(crate) use config::cmd_check_config;
pub(crate) use payout::{cmd_payout, PayoutOptions};
pub(crate) use quote::cmd_quote;
pub(crate) use settle::{cmd_settle, cmd_settle_all};

use serde::Serialize;

/// Pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let pretty =
        serde_json::to_string_pretty(value).map_err(|e| format!("serialization error: {e}"))?;
    println!("{}", pretty);
    Ok(())
}
