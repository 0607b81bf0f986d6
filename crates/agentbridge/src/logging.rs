use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Overrides `--log-level` with a full filter directive, e.g.
/// `agentbridge_frame=trace,info`.
pub const LOG_ENV: &str = "AGENTBRIDGE_LOG";

const CRATES: [&str; 5] = [
    "agentbridge",
    "agentbridge_transport",
    "agentbridge_frame",
    "agentbridge_envelope",
    "agentbridge_peer",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// `level` for the bridge crates; everything else stays at `warn` or quieter.
pub fn default_directives(level: LogLevel) -> String {
    let level = level.as_filter();
    let outside = level.min(LevelFilter::WARN);
    let mut directives = vec![outside.to_string().to_lowercase()];
    let level = level.to_string().to_lowercase();
    directives.extend(CRATES.iter().map(|name| format!("{name}={level}")));
    directives.join(",")
}

fn build_filter(level: LogLevel, directive: Option<&str>) -> EnvFilter {
    if let Some(directive) = directive {
        match EnvFilter::try_new(directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("invalid {LOG_ENV} directive ({err}); using --log-level"),
        }
    }
    EnvFilter::new(default_directives(level))
}

/// Install the stderr subscriber. Stdout stays reserved for command output.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let directive = std::env::var(LOG_ENV).ok();
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(build_filter(level, directive.as_deref()))
        .with_ansi(false)
        .with_target(level >= LogLevel::Debug || directive.is_some());

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}
