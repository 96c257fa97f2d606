pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the root logger from the default terminal configuration.
pub fn init() -> Logger {
    from_toml_str(DEFAULT_CONFIG).expect("Default logger configuration must be valid")
}

/// Builds a root logger from a TOML logger configuration string.
pub fn from_toml_str(config: &str) -> Result<Logger, Box<dyn std::error::Error>> {
    let config: LoggerConfig = serdeconv::from_toml_str(config)?;
    let logger = config.build_logger()?;
    Ok(logger)
}

/// A logger that swallows all records. Used by tests and as the fallback for
/// components constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
