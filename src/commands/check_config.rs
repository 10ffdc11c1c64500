use crate::cli::CheckConfigArgs;
use crate::commands::load_config;
use crate::exit_codes;
use crate::output;
use bsl_engine::EngineConfig;
use serde::Serialize;

#[derive(Serialize)]
struct CheckOutput {
    source: String,
    valid: bool,
    config: Option<EngineConfig>,
    error: Option<String>,
}

pub fn execute(args: CheckConfigArgs) -> i32 {
    let source = args
        .config
        .clone()
        .unwrap_or_else(|| "defaults".to_string());
    let result = load_config(args.config.as_deref());

    let exit_code = if result.is_ok() {
        exit_codes::SUCCESS
    } else {
        exit_codes::CONFIG_ERROR
    };

    if args.json {
        let (config, error) = match result {
            Ok(config) => (Some(config), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let report = CheckOutput {
            source,
            valid: error.is_none(),
            config,
            error,
        };
        let written = output::emit(&report, false, None);
        if written != exit_codes::SUCCESS {
            return written;
        }
    } else {
        match result {
            Ok(config) => println!(
                "Configuration '{}' is valid ({} s buffer, probe every {} ms, debounce {} ms)",
                source,
                config.buffer.duration_secs,
                config.clock.probe_interval_ms,
                config.trigger.debounce_ms
            ),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    exit_code
}
