use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const FILTER_VAR: &str = "NOTIFO_LOG_FILTER";
const TRACE_DEPS_VAR: &str = "NOTIFO_TRACE_DEPS";

/// Event targets of the client, one per subsystem.
pub const SUBSYSTEM_TARGETS: &[&str] = &[
    "notifo.poll",
    "notifo.hub",
    "notifo.dedup",
    "notifo.jobs",
    "notifo.registration",
    "notifo.widget",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter `{filter}`: {reason}")]
    Filter { filter: String, reason: String },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(FILTER_VAR) {
        Ok(raw) if !raw.trim().is_empty() => raw,
        _ => default_directives(config.level.into(), dependency_traces_allowed()),
    };
    let env_filter = EnvFilter::try_new(&filter).map_err(|err| InitError::Filter {
        filter: filter.clone(),
        reason: err.to_string(),
    })?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    tracing::debug!(target: "notifo.widget", %filter, "logging initialised");
    Ok(())
}

/// Subsystem targets get the requested level. Everything else (reqwest,
/// hyper, tungstenite and friends) is capped at `info` unless
/// `allow_dependency_traces` is set.
fn default_directives(level: LevelFilter, allow_dependency_traces: bool) -> String {
    let ambient = if allow_dependency_traces {
        level
    } else {
        level.min(LevelFilter::INFO)
    };
    if ambient == level {
        return level.to_string().to_lowercase();
    }

    let mut directives = vec![ambient.to_string().to_lowercase()];
    directives.extend(
        SUBSYSTEM_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.to_string().to_lowercase())),
    );
    directives.join(",")
}

fn dependency_traces_allowed() -> bool {
    std::env::var(TRACE_DEPS_VAR)
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_levels_apply_to_subsystems_only() {
        let filter = default_directives(LevelFilter::TRACE, false);
        assert!(filter.starts_with("info,"));
        for target in SUBSYSTEM_TARGETS {
            assert!(filter.contains(&format!("{target}=trace")), "{filter}");
        }
        assert_eq!(
            default_directives(LevelFilter::DEBUG, false).split(',').count(),
            SUBSYSTEM_TARGETS.len() + 1
        );
        assert!(EnvFilter::try_new(&filter).is_ok());
    }

    #[test]
    fn dependency_traces_lift_the_cap() {
        assert_eq!(default_directives(LevelFilter::TRACE, true), "trace");
    }

    #[test]
    fn quiet_levels_use_a_single_directive() {
        assert_eq!(default_directives(LevelFilter::WARN, false), "warn");
        assert_eq!(default_directives(LevelFilter::INFO, false), "info");
        assert_eq!(LogLevel::default(), LogLevel::Warn);
        assert_eq!(LevelFilter::from(LogLevel::Error), LevelFilter::ERROR);
    }

    #[test]
    fn client_events_carry_subsystem_targets() {
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::layer::{Context, SubscriberExt};
        use tracing_subscriber::Layer;

        struct Targets(Arc<Mutex<Vec<String>>>);

        impl<S: tracing::Subscriber> Layer<S> for Targets {
            fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
                self.0.lock().unwrap().push(event.metadata().target().to_string());
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::try_new("off,notifo.jobs=error").unwrap())
            .with(Targets(seen.clone()));
        tracing::subscriber::with_default(subscriber, || {
            // No runtime here, so the queue logs and drops the job.
            job_queue::JobQueue::new().enqueue(|| async { job_queue::JobResult::Ok(()) });
        });

        assert_eq!(seen.lock().unwrap().as_slice(), ["notifo.jobs"]);
    }
}
