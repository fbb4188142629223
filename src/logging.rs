use chrono::{DateTime, Utc};
use serde_json::json;
use std::io::Write;

/// Initializes the process-wide logger. Text format goes through plain
/// env_logger; JSON format swaps in a structured line formatter for log
/// collectors. Safe to call more than once; later calls are no-ops.
pub fn init(level: &str, json: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if json {
        builder.format(|buf, record| {
            let timestamp: DateTime<Utc> = Utc::now();
            let entry = json!({
                "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", entry)
        });
    }

    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("info", false);
        init("debug", true);
        log::info!("logger initialized twice without panicking");
    }
}
