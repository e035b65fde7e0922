//! Process-wide structured logging setup, mirroring `flux::logging::init`.
//!
//! Every client connection, gate agent, and dispatcher takes a `slog::Logger`
//! rather than reaching for a global; this just builds the default one.

use slog::Logger;
use sloggers::{Build, Config, LoggerConfig};

/// Builds a terminal logger from an inline TOML config, the same shape
/// `flux::logging::init` reads. `level` overrides the config's level so
/// callers don't need to hand-edit TOML for the common case.
pub fn init(level: &str) -> Logger {
    let toml = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );

    let config: LoggerConfig = match serdeconv::from_toml_str(&toml) {
        Ok(config) => config,
        Err(_) => return Logger::root(slog::Discard, slog::o!()),
    };

    config.build_logger().unwrap_or_else(|_| Logger::root(slog::Discard, slog::o!()))
}

/// A logger that discards everything, for tests and embedders that wire up
/// their own `slog::Logger` instead.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}
