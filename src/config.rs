//! Fixture configuration.
//!
//! A [`ServerConfig`] is assembled once through [`ServerConfigBuilder`] and
//! never changes afterwards; `RedisServer` keeps its own copy for its whole
//! lifetime.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::executable::bundle::{BinaryBundle, DirectoryBundle, StaticBundle};
use crate::port::PortRegistry;
use crate::readiness::DEFAULT_READY_MARKER;

/// How long `start` waits for the ready marker by default.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `shutdown` waits for the process to exit after killing it.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives every line the server writes, plus teardown warnings.
///
/// Called from both the stdout and the stderr reader task, possibly at the
/// same time, hence the `Send + Sync` bound.
#[derive(Clone)]
pub struct LogSink(Arc<dyn Fn(&str) + Send + Sync>);

impl LogSink {
    /// Wrap a closure.
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Forward lines to `tracing` at debug level.
    pub fn tracing() -> Self {
        Self::new(|line| tracing::debug!(target: "redis_fixture::server", "{}", line))
    }

    /// Drop every line.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Hand one line to the sink.
    pub fn log(&self, line: &str) {
        (self.0)(line)
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink")
    }
}

/// Frozen settings for one fixture.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    port: Option<u16>,
    log_sink: LogSink,
    use_external_binary: bool,
    executable_path: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    bundle: Arc<dyn BinaryBundle>,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    ready_marker: String,
    extra_args: Vec<String>,
    port_registry: Arc<PortRegistry>,
}

impl ServerConfig {
    /// Builder starting from defaults.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Explicit port, `None` when one is allocated at start.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Where captured output lines go.
    pub fn log_sink(&self) -> &LogSink {
        &self.log_sink
    }

    /// Use an installed redis-server instead of the bundled one.
    pub fn use_external_binary(&self) -> bool {
        self.use_external_binary
    }

    /// Explicit executable for external mode, bypassing the PATH lookup.
    pub fn executable_path(&self) -> Option<&PathBuf> {
        self.executable_path.as_ref()
    }

    /// Directory for extracted executables, `None` for the OS default.
    pub fn temp_dir(&self) -> Option<&PathBuf> {
        self.temp_dir.as_ref()
    }

    /// Source of the executable in bundled mode.
    pub fn bundle(&self) -> &Arc<dyn BinaryBundle> {
        &self.bundle
    }

    /// Upper bound on the wait for the ready marker.
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Upper bound on the wait for exit after the kill.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Output substring that signals readiness.
    pub fn ready_marker(&self) -> &str {
        &self.ready_marker
    }

    /// Arguments appended after `--port`/`--bind`.
    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    /// Registry ports are claimed from.
    pub fn port_registry(&self) -> &Arc<PortRegistry> {
        &self.port_registry
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            log_sink: LogSink::default(),
            use_external_binary: false,
            executable_path: None,
            temp_dir: None,
            bundle: Arc::new(StaticBundle::default()),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            extra_args: Vec::new(),
            port_registry: PortRegistry::global(),
        }
    }
}

/// Fluent builder for [`ServerConfig`].
///
/// ```rust,no_run
/// use redis_fixture::ServerConfig;
///
/// let config = ServerConfig::builder()
///     .port(6390)
///     .log_to(|line| eprintln!("redis: {line}"))
///     .use_external_binary(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.port(), Some(6390));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Start from defaults overridden by `REDIS_FIXTURE_*` variables.
    ///
    /// | Variable                           | Setting               |
    /// |------------------------------------|-----------------------|
    /// | `REDIS_FIXTURE_PORT`               | `port`                |
    /// | `REDIS_FIXTURE_EXTERNAL`           | `use_external_binary` |
    /// | `REDIS_FIXTURE_EXECUTABLE`         | `executable_path`     |
    /// | `REDIS_FIXTURE_TEMP_DIR`           | `temp_dir`            |
    /// | `REDIS_FIXTURE_BUNDLE_DIR`         | `bundle`              |
    /// | `REDIS_FIXTURE_STARTUP_TIMEOUT_MS` | `startup_timeout`     |
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::default();

        if let Some(port) = optional_env("REDIS_FIXTURE_PORT")? {
            builder = builder.port(parse_value("REDIS_FIXTURE_PORT", &port)?);
        }
        if let Some(external) = optional_env("REDIS_FIXTURE_EXTERNAL")? {
            builder = builder.use_external_binary(
                external
                    .parse()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "REDIS_FIXTURE_EXTERNAL".to_string(),
                        message: format!("must be 'true' or 'false': {e}"),
                    })?,
            );
        }
        if let Some(path) = optional_env("REDIS_FIXTURE_EXECUTABLE")? {
            builder = builder.executable_path(path);
        }
        if let Some(dir) = optional_env("REDIS_FIXTURE_TEMP_DIR")? {
            builder = builder.temp_dir(dir);
        }
        if let Some(dir) = optional_env("REDIS_FIXTURE_BUNDLE_DIR")? {
            builder = builder.bundle(DirectoryBundle::new(dir));
        }

        let timeout_ms = parse_optional_env(
            "REDIS_FIXTURE_STARTUP_TIMEOUT_MS",
            DEFAULT_STARTUP_TIMEOUT.as_millis() as u64,
        )?;
        Ok(builder.startup_timeout(Duration::from_millis(timeout_ms)))
    }

    /// Listen on `port` instead of a random one.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Send output lines to a closure.
    pub fn log_to(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.config.log_sink = LogSink::new(sink);
        self
    }

    /// Send output lines to `sink`.
    pub fn log_sink(mut self, sink: LogSink) -> Self {
        self.config.log_sink = sink;
        self
    }

    /// Run the installed redis-server instead of the bundled one.
    pub fn use_external_binary(mut self, external: bool) -> Self {
        self.config.use_external_binary = external;
        self
    }

    /// Run this executable directly. Implies external mode.
    pub fn executable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.executable_path = Some(path.into());
        self.config.use_external_binary = true;
        self
    }

    /// Extract bundled executables into `dir`.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = Some(dir.into());
        self
    }

    /// Take bundled executables from `bundle`.
    pub fn bundle(mut self, bundle: impl BinaryBundle + 'static) -> Self {
        self.config.bundle = Arc::new(bundle);
        self
    }

    /// Give up on readiness after `timeout`.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    /// Wait at most `timeout` for the killed process to exit.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Treat `marker` in the output as the ready signal.
    pub fn ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.ready_marker = marker.into();
        self
    }

    /// Append one command-line argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.extra_args.push(arg.into());
        self
    }

    /// Append several command-line arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Make this server a replica of a primary on `127.0.0.1:<port>`.
    pub fn replica_of(self, primary_port: u16) -> Self {
        self.args(["--replicaof", "127.0.0.1"])
            .arg(primary_port.to_string())
    }

    /// Use a private registry instead of the process-wide one.
    pub fn port_registry(mut self, registry: Arc<PortRegistry>) -> Self {
        self.config.port_registry = registry;
        self
    }

    /// Validate and freeze the settings.
    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let config = self.config;

        if config.port == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "port".to_string(),
                message: "must be between 1 and 65535".to_string(),
            });
        }
        if config.startup_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "startup_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if config.ready_marker.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ready_marker".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(config)
    }
}

/// Read an environment variable, treating empty as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    optional_env(key)?
        .map(|value| parse_value(key, &value))
        .transpose()
        .map(|v| v.unwrap_or(default))
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{value}': {e}"),
    })
}
