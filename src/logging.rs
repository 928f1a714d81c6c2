use env_logger::{Builder, Env};
use log::SetLoggerError;

/// Install the process logger. `RUST_LOG` wins over `default_filter`.
pub fn init(default_filter: &str) -> Result<(), SetLoggerError> {
    Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .format_target(true)
        .try_init()
}
