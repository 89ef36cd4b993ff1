pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger writing to stderr. Components derive
/// child loggers from the returned root with `log.new(o!(...))`.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logging config");

    config.build_logger().expect("Error building logger")
}

/// A logger that swallows all records, for components constructed without a parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
