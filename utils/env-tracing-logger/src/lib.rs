use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    filter::LevelFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Keeps logging alive for as long as it is held.
pub struct Guard {
    _priv: (),
}

/// Where log output goes and which level applies without `RUST_LOG`.
#[derive(Debug, Clone)]
pub struct Options {
    /// Also write (without ANSI colors) to this file.
    pub file: Option<std::path::PathBuf>,
    pub console: bool,
    /// Directive used when `RUST_LOG` is not set.
    pub default_level: LevelFilter,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            file: None,
            console: true,
            default_level: LevelFilter::INFO,
        }
    }
}

/// Log to the console, `RUST_LOG` overriding the `info` default.
pub fn init() -> Guard {
    init_with(Options::default()).expect("initialize logging")
}

/// Start logging to file and console, both optional.
pub fn init_with(opts: Options) -> Result<Guard, BoxError> {
    // Fixed offset from the timezone at startup.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = match &opts.file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Some(
                fmt::layer()
                    .with_timer(timer.clone())
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let console_layer = opts.console.then(|| {
        fmt::layer()
            .with_timer(timer)
            .with_ansi(!cfg!(windows))
            .with_target(true)
    });

    let filter = EnvFilter::builder()
        .with_default_directive(opts.default_level.into())
        .from_env_lossy();

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter);
    tracing::subscriber::set_global_default(collector)?;

    let log_var = match std::env::var("RUST_LOG") {
        Ok(var) => format!(" with RUST_LOG=\"{var}\""),
        Err(_) => format!(" at default level {}", opts.default_level),
    };
    if let Some(path) = &opts.file {
        tracing::debug!("Logging to file \"{}\"{log_var}.", path.display());
    }
    if opts.console {
        tracing::debug!("Logging to console{log_var}.");
    }

    Ok(Guard { _priv: () })
}
