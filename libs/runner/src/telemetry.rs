use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Install the global tracing subscriber.
///
/// `filter` is an `EnvFilter` directive string, e.g.
/// `"info,piped_runner=debug"`.
pub fn init(filter: &str, format: LogFormat) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_new(filter).map_err(|e| format!("invalid log filter {filter:?}: {e}"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    match format {
        LogFormat::Text => builder
            .try_init()
            .map_err(|e| format!("failed to init logging: {e}")),
        LogFormat::Json => builder
            .json()
            .try_init()
            .map_err(|e| format!("failed to init logging: {e}")),
    }
}
