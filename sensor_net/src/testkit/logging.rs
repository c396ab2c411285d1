use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Fatal,
  Off,
}
impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;

  /// The `tracing` filter directive for this level. `tracing` has nothing above `error`, so
  /// `Fatal` shares it.
  pub fn directive(&self) -> &'static str {
    match self {
      LogLevel::Trace => "trace",
      LogLevel::Debug => "debug",
      LogLevel::Info => "info",
      LogLevel::Warn => "warn",
      LogLevel::Error | LogLevel::Fatal => "error",
      LogLevel::Off => "off",
    }
  }
}

/// Installs a global fmt subscriber at `level`, unless `RUST_LOG` says otherwise. Calling it again
/// is harmless, so every test may call it.
pub fn init(level: LogLevel) {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_test_writer()
    .try_init();
}

#[test]
fn test_log_levels() {
  assert!(LogLevel::MIN <= LogLevel::Warn);
  assert!(LogLevel::Fatal < LogLevel::Off);
  assert_eq!(LogLevel::Fatal.directive(), LogLevel::Error.directive());
  init(LogLevel::Off);
  init(LogLevel::Debug);
}
