use bazaar_engine::fees::verification_quote;
use bazaar_engine::MarketConfig;

use super::print_json;
use crate::OutputFormat;

pub(crate) fn cmd_quote(level: u8, config: &MarketConfig, output: OutputFormat) -> Result<(), String> {
    let split = verification_quote(config, level).map_err(|e| e.to_string())?;
    match output {
        OutputFormat::Json => print_json(&serde_json::json!({
            "level": level,
            "currency": config.currency,
            "fee": split.fee,
            "verifier_share": split.verifier_share,
            "platform_share": split.platform_share,
        })),
        OutputFormat::Text => {
            println!(
                "level {}: fee {} {} (verifier {}, platform {})",
                level, split.fee, config.currency, split.verifier_share, split.platform_share
            );
            Ok(())
        }
    }
}
