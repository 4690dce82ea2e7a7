//! Logging setup shared by the workspace's binaries.

/// Configures logging for all subcommands. The flag names match the
/// convention used across the cluster's tooling so that operators see a
/// consistent surface everywhere.
#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// The log verbosity. Accepts an env-filter directive, so plain levels
    /// (trace|debug|info|warn|error|off) and per-module filters both work.
    #[arg(
        long = "log.level",
        default_value = "info",
        env = "LOG_LEVEL",
        group = "logging",
        global = true
    )]
    pub level: String,

    #[arg(long = "log.format", value_enum, global = true, group = "logging")]
    pub format: Option<LogFormat>,
}

/// The format for logs.
#[derive(Debug, clap::ValueEnum, Clone, Copy)]
pub enum LogFormat {
    /// Logs are written to stderr in jsonl format, one event per line,
    /// suitable for programmatic collection.
    Json,
    /// Plain text with no colors.
    Text,
}

/// Initializes logging, using the given args. Panics if called twice.
pub fn init_logging(args: &LogArgs) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(&args.level)
        // Spans are logged once, when they close, so timing information is
        // recorded without doubling the line count.
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_target(false);

    match args.format.unwrap_or(LogFormat::Text) {
        LogFormat::Json => {
            builder
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .init();
        }
        LogFormat::Text => {
            builder.compact().with_ansi(false).init();
        }
    }
}
