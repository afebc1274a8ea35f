use bazaar_engine::MarketConfig;

use super::print_json;
use crate::OutputFormat;

/// `load_config` has already validated; this only echoes the effective
/// configuration, defaults included.
pub(crate) fn cmd_check_config(config: &MarketConfig, output: OutputFormat) -> Result<(), String> {
    match output {
        OutputFormat::Json => print_json(config),
        OutputFormat::Text => {
            let text =
                toml::to_string_pretty(config).map_err(|e| format!("serialization error: {e}"))?;
            print!("{}", text);
            println!("# configuration ok");
            Ok(())
        }
    }
}
