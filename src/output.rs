// JSON reports on stdout or in a file

use crate::exit_codes;
use serde::Serialize;
use std::io::Write;

/// Serialize `report` and write it to `path` (stdout when `None`).
///
/// Returns the exit code for the write itself; failures are printed.
pub fn emit<T: Serialize>(report: &T, compact: bool, path: Option<&str>) -> i32 {
    match render(report, compact).and_then(|json| write(&json, path)) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::EXECUTION_ERROR
        }
    }
}

fn render<T: Serialize>(report: &T, compact: bool) -> Result<String, String> {
    let json = if compact {
        serde_json::to_string(report)
    } else {
        serde_json::to_string_pretty(report)
    };
    json.map_err(|e| format!("cannot serialize report: {}", e))
}

fn write(json: &str, path: Option<&str>) -> Result<(), String> {
    match path {
        Some(path) => std::fs::write(path, format!("{}\n", json))
            .map_err(|e| format!("cannot write report to '{}': {}", path, e)),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json)
                .map_err(|e| format!("cannot write report to stdout: {}", e))
        }
    }
}
