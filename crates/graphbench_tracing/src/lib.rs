use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, filter::ParseError, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("cannot create log file {}: {source}", .path.display())]
    File { path: PathBuf, source: io::Error },
    #[error("cannot install tracing subscriber: {0}")]
    Install(String),
}

pub struct TraceOptions {
    log_file: Option<PathBuf>,
    pub env_filter: Option<String>,
}

/// A stderr subscriber with opinionated defaults. Output never goes to
/// stdout, which carries the benchmark result.
pub fn subscriber() -> TraceOptions {
    TraceOptions {
        log_file: None,
        env_filter: None,
    }
}

impl TraceOptions {
    /// Also write events to `path`, through a background writer.
    pub fn log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn env_filter(mut self, env_filter: impl ToString) -> Self {
        self.env_filter = Some(env_filter.to_string());
        self
    }

    fn filter(&self) -> Result<EnvFilter, TraceError> {
        match &self.env_filter {
            Some(f) => EnvFilter::builder().parse(f).map_err(TraceError::Filter),
            None => Ok(EnvFilter::builder()
                .with_default_directive(tracing::Level::WARN.into())
                .from_env_lossy()),
        }
    }

    /// Install as the global tracing subscriber
    pub fn init(self) -> Result<TraceSession, TraceError> {
        let filter = self.filter()?;
        let stderr = tracing_subscriber::fmt::layer().with_writer(io::stderr);
        if let Some(path) = self.log_file {
            let file = File::create(&path).map_err(|source| TraceError::File {
                path: path.clone(),
                source,
            })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()
                .map_err(|e| TraceError::Install(e.to_string()))?;
            Ok(TraceSession {
                _guard: Some(guard),
                log_path: Some(path),
            })
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .try_init()
                .map_err(|e| TraceError::Install(e.to_string()))?;
            Ok(TraceSession {
                _guard: None,
                log_path: None,
            })
        }
    }
}

/// Keeps the background log writer alive. Buffered events are flushed when
/// this is dropped.
pub struct TraceSession {
    _guard: Option<WorkerGuard>,
    pub log_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_filter() {
        let opts = subscriber().env_filter("graphbench=notalevel");
        assert!(matches!(opts.filter(), Err(TraceError::Filter(_))));
        assert!(subscriber().env_filter("graphbench=debug,warn").filter().is_ok());
    }

    #[test]
    fn builder_records_log_file() {
        let opts = subscriber().log_file("/tmp/graphbench.log");
        assert_eq!(opts.log_file, Some(PathBuf::from("/tmp/graphbench.log")));
        assert!(opts.env_filter.is_none());
    }

    #[test]
    fn unwritable_log_file_is_reported() {
        let path = std::env::temp_dir().join("graphbench-missing-dir").join("run.log");
        let err = subscriber().log_file(&path).init().err().unwrap();
        match &err {
            TraceError::File { path: p, .. } => assert_eq!(p, &path),
            other => panic!("unexpected error: {other}"),
        }
        let msg = err.to_string();
        assert!(msg.starts_with("cannot create log file "));
        assert!(msg.contains("run.log: "));
        assert!(std::error::Error::source(&err).is_some());
    }
}
