//! Console and JSONL file logging for Strand
//!
//! Everything in Strand logs through `tracing`; this crate wires the
//! subscriber once per process.
//!
//! # Quick Start
//!
//! ```ignore
//! use strand_logging::{LogConfig, StrandSubscriberBuilder};
//!
//! // JSONL to stderr
//! let _guard = StrandSubscriberBuilder::new().init();
//!
//! // Pretty human-readable output while developing
//! let _guard = StrandSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init();
//! ```
//!
//! Keep the returned guard alive for as long as file output is wanted;
//! dropping it flushes and stops the background writer.

pub mod config;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// A formatting layer erased to a common type
pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to create rolling log file: {0}")]
    Appender(#[from] InitError),

    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),

    #[error("a global subscriber is already set")]
    AlreadyInitialized,
}

/// Builder for configuring and initializing the Strand logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output during development.
pub struct StrandSubscriberBuilder {
    config: LogConfig,
}

impl StrandSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// The filter in effect: `RUST_LOG` if set, else the default level
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => Ok(EnvFilter::try_new(&self.config.default_level)?),
        }
    }

    /// Build the output layers without installing them
    ///
    /// The guard is returned when file output is configured.
    pub fn build_layers(&self) -> Result<(Vec<BoxedLayer>, Option<WorkerGuard>), LoggingError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        let console = &self.config.console;
        if console.enabled {
            if console.pretty {
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(console.ansi)
                        .with_target(true)
                        .with_writer(std::io::stderr)
                        .boxed(),
                );
            } else {
                layers.push(self.jsonl_layer(std::io::stderr));
            }
        }

        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = create_file_writer(file_config)?;
            layers.push(self.jsonl_layer(writer));
            guard = Some(file_guard);
        }

        Ok((layers, guard))
    }

    fn jsonl_layer<W>(&self, writer: W) -> BoxedLayer
    where
        W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let jsonl = &self.config.jsonl;
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(jsonl.include_spans)
            .flatten_event(jsonl.flatten_events)
            .with_file(jsonl.include_location)
            .with_line_number(jsonl.include_location)
            .with_writer(writer)
            .boxed()
    }

    /// Try to initialize the subscriber globally
    ///
    /// Fails if a global subscriber has already been set.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let filter = self.env_filter()?;
        let (layers, guard) = self.build_layers()?;

        tracing_subscriber::registry()
            .with(layers)
            .with(filter)
            .try_init()
            .map_err(|_| LoggingError::AlreadyInitialized)?;

        Ok(guard)
    }

    /// Initialize the subscriber globally, reporting failures on stderr
    ///
    /// Returns the file writer guard, which must be kept alive for the
    /// duration of the program.
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: Failed to initialize logging: {}", e);
                None
            }
        }
    }
}

impl Default for StrandSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Truncates for Never rotation, appends for the others
fn create_file_writer(file_config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&file_config.directory)?;

    let rotation = match file_config.rotation {
        RotationStrategy::Never => {
            let path = file_config
                .directory
                .join(format!("{}.log", file_config.prefix));
            let file = File::create(path)?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&file_config.prefix)
        .filename_suffix("log");
    if let Some(max) = file_config.max_files {
        builder = builder.max_log_files(max);
    }
    let appender = builder.build(&file_config.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize logging with default settings (JSONL to stderr)
pub fn init_default() -> Option<WorkerGuard> {
    StrandSubscriberBuilder::new().init()
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() -> Option<WorkerGuard> {
    StrandSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Initialize logging for testing (minimal output); repeated calls are ignored
pub fn init_testing() {
    let _ = StrandSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}
