//! Lifecycle of one disposable redis-server process.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              RedisServer                                   │
//! │                                                                            │
//! │   start(config)                                                            │
//! │         │                                                                  │
//! │         ▼                                                                  │
//! │   ┌──────────────┐     ┌──────────────┐     ┌──────────────────────────┐  │
//! │   │ Claim Port   │────▶│ Resolve      │────▶│ Spawn redis-server       │  │
//! │   │ (registry)   │     │ Executable   │     │ --port N --bind 127.0.0.1│  │
//! │   └──────────────┘     └──────────────┘     └──────────────────────────┘  │
//! │                                                     │                      │
//! │                              ┌──────────────────────┴───────┐              │
//! │                              ▼                              ▼              │
//! │                       ┌──────────────┐             ┌──────────────┐        │
//! │                       │ stdout task  │             │ stderr task  │        │
//! │                       │ sink + ready │             │ sink         │        │
//! │                       └──────────────┘             └──────────────┘        │
//! │                              │                                             │
//! │                              ▼                                             │
//! │   ready / exited / timed out ──▶ Ok(server) or shutdown() + Err            │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `shutdown()` is the release contract. `Drop` only kills the process and
//! removes the temp copy on a best-effort basis, and logs a warning.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::{ServerConfig, ServerConfigBuilder};
use crate::error::{Error, Result};
use crate::executable::{ExecutableResolver, ScopedTempFile};
use crate::port::PortLease;
use crate::readiness::ReadinessDetector;

/// Output lines kept for startup error reports.
const OUTPUT_TAIL_LINES: usize = 32;

/// How long to let the readers drain after the process died during startup.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const SPAWN_ATTEMPTS: u32 = 5;

/// How long a process that just printed the ready marker must stay up.
const READY_SETTLE: Duration = Duration::from_millis(50);

/// Fans server output out to the log sink and a bounded tail buffer.
///
/// Once closed, late lines from the reader tasks are dropped.
#[derive(Debug)]
struct OutputCapture {
    config: ServerConfig,
    tail: Mutex<VecDeque<String>>,
    closed: AtomicBool,
}

impl OutputCapture {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            tail: Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)),
            closed: AtomicBool::new(false),
        }
    }

    fn record(&self, line: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        self.config.log_sink().log(line);

        let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    fn tail(&self) -> Vec<String> {
        self.tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Read `stream` line by line until EOF. Invalid UTF-8 is replaced, not fatal.
fn spawn_reader<R>(
    stream: R,
    capture: Arc<OutputCapture>,
    detector: Option<Arc<ReadinessDetector>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut segments = BufReader::new(stream).split(b'\n');
        loop {
            match segments.next_segment().await {
                Ok(Some(bytes)) => {
                    let line = String::from_utf8_lossy(&bytes);
                    let line = line.trim_end_matches('\r');
                    capture.record(line);
                    if let Some(detector) = &detector {
                        detector.observe(line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

/// Spawn `command`, riding out `ETXTBSY`.
///
/// A freshly extracted executable can still be open for writing in a child
/// forked concurrently by another thread; exec fails until that child execs
/// or exits.
async fn spawn(command: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Err(e) if e.kind() == ErrorKind::ExecutableFileBusy && attempt < SPAWN_ATTEMPTS => {
                tracing::debug!("Executable busy, retrying spawn (attempt {})", attempt);
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            result => return result,
        }
    }
}

/// Whether a line reports that the listening socket could not be bound.
fn is_bind_failure(line: &str) -> bool {
    let line = line.to_lowercase();
    line.contains("address already in use")
        || line.contains("could not create server tcp listening socket")
        || line.contains("bind:")
}

/// How the wait for the ready marker ended.
enum Startup {
    Ready,
    TimedOut,
    Exited(std::io::Result<ExitStatus>),
}

/// A running redis-server bound to `127.0.0.1`.
///
/// ```rust,no_run
/// use redis_fixture::RedisServer;
///
/// # async fn example() -> redis_fixture::Result<()> {
/// let mut server = RedisServer::start_with(|c| c.use_external_binary(true)).await?;
/// println!("redis at {}", server.endpoint());
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RedisServer {
    port: u16,
    pid: Option<u32>,
    config: ServerConfig,
    executable_path: PathBuf,
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    capture: Arc<OutputCapture>,
    temp_file: Option<ScopedTempFile>,
    port_lease: Option<PortLease>,
    disposed: bool,
}

impl RedisServer {
    /// Start a server and wait until it accepts connections.
    ///
    /// Returns only once the ready marker was seen. On any failure every
    /// partially acquired resource (port claim, temp copy, process) is
    /// released before the error is returned.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let resolver = ExecutableResolver::current()?;
        Self::start_with_resolver(config, resolver).await
    }

    /// Start from the environment defaults with one configuration mutator.
    ///
    /// ```rust,no_run
    /// # async fn example() -> redis_fixture::Result<()> {
    /// let server = redis_fixture::RedisServer::start_with(|c| {
    ///     c.port(6390).log_to(|line| println!("{line}"))
    /// })
    /// .await?;
    /// assert_eq!(server.port(), 6390);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start_with<F>(configure: F) -> Result<Self>
    where
        F: FnOnce(ServerConfigBuilder) -> ServerConfigBuilder,
    {
        let config = configure(ServerConfigBuilder::from_env()?).build()?;
        Self::start(config).await
    }

    async fn start_with_resolver(config: ServerConfig, resolver: ExecutableResolver) -> Result<Self> {
        let registry = config.port_registry();
        let lease = match config.port() {
            Some(port) => registry.claim(port),
            None => registry.allocate(),
        };
        let port = lease.port();

        let resolved = resolver.resolve(&config)?;
        let executable_path = resolved.path().to_path_buf();

        let mut args = resolver.platform().server_args(port);
        args.extend(config.extra_args().iter().cloned());

        tracing::debug!(
            "Spawning {} {}",
            executable_path.display(),
            args.join(" ")
        );

        let mut command = Command::new(&executable_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = spawn(&mut command).await.map_err(|e| Error::BindOrStart {
            port,
            reason: format!("failed to spawn {}: {}", executable_path.display(), e),
        })?;

        let capture = Arc::new(OutputCapture::new(config.clone()));
        let detector = Arc::new(ReadinessDetector::new(config.ready_marker()));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                Arc::clone(&capture),
                Some(Arc::clone(&detector)),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&capture), None));
        }

        let mut server = Self {
            port,
            pid: child.id(),
            config,
            executable_path,
            child: Some(child),
            readers,
            capture,
            temp_file: resolved.into_temp_file(),
            port_lease: Some(lease),
            disposed: false,
        };

        match server.wait_until_ready(&detector).await {
            Ok(()) => {
                tracing::info!(
                    "redis-server ready at {} (pid {:?})",
                    server.endpoint(),
                    server.pid
                );
                Ok(server)
            }
            Err(e) => {
                tracing::debug!("redis-server on port {} failed to start: {}", port, e);
                server.shutdown().await;
                Err(e)
            }
        }
    }

    async fn wait_until_ready(&mut self, detector: &ReadinessDetector) -> Result<()> {
        let timeout = self.config.startup_timeout();
        let Some(child) = self.child.as_mut() else {
            return Err(Error::BindOrStart {
                port: self.port,
                reason: "process handle missing".to_string(),
            });
        };

        let startup = tokio::select! {
            biased;
            ready = detector.wait(timeout) => {
                if ready { Startup::Ready } else { Startup::TimedOut }
            }
            status = child.wait() => Startup::Exited(status),
        };

        // A process that announces readiness and then dies is not running.
        let startup = match startup {
            Startup::Ready => match tokio::time::timeout(READY_SETTLE, child.wait()).await {
                Ok(status) => Startup::Exited(status),
                Err(_) => Startup::Ready,
            },
            other => other,
        };

        match startup {
            Startup::Ready => Ok(()),
            Startup::TimedOut => Err(Error::StartupTimeout {
                port: self.port,
                timeout,
            }),
            Startup::Exited(Err(e)) => Err(Error::Io(e)),
            Startup::Exited(Ok(status)) => {
                self.drain_readers().await;
                let output = self.capture.tail();

                if let Some(line) = output.iter().find(|line| is_bind_failure(line)) {
                    return Err(Error::BindOrStart {
                        port: self.port,
                        reason: line.trim().to_string(),
                    });
                }

                Err(Error::ProcessExited {
                    port: self.port,
                    status: status.to_string(),
                    output,
                })
            }
        }
    }

    /// Let the readers pick up whatever the dead process left in its pipes.
    async fn drain_readers(&mut self) {
        let readers = std::mem::take(&mut self.readers);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            for reader in readers {
                let _ = reader.await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::debug!("Output readers still busy after {:?}", DRAIN_TIMEOUT);
        }
    }

    /// Loopback address the server listens on.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    /// Port the server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `redis://127.0.0.1:<port>`, the form most clients accept.
    pub fn connection_url(&self) -> String {
        format!("redis://{}", self.endpoint())
    }

    /// OS process id, `None` after shutdown.
    pub fn pid(&self) -> Option<u32> {
        if self.disposed { None } else { self.pid }
    }

    /// The executable that was launched; a temp copy in bundled mode.
    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    /// Configuration the server was started with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether `shutdown()` has run.
    pub fn is_shut_down(&self) -> bool {
        self.disposed
    }

    /// Whether the process is still alive.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop the server and release everything it owns.
    ///
    /// Stops output capture, kills the process, waits up to the configured
    /// shutdown timeout for it to exit, deletes the temp copy and frees the
    /// port claim. Idempotent, and never fails: problems are logged to
    /// `tracing` and to the log sink.
    pub async fn shutdown(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.capture.close();
        for reader in self.readers.drain(..) {
            reader.abort();
        }

        if let Some(mut child) = self.child.take() {
            self.stop_process(&mut child).await;
        }

        if let Some(mut temp_file) = self.temp_file.take()
            && let Err(e) = temp_file.try_release()
        {
            self.teardown_warning(&format!(
                "failed to delete {}: {}",
                temp_file.path().display(),
                e
            ));
        }

        self.port_lease.take();
        tracing::info!("Stopped redis-server on port {}", self.port);
    }

    async fn stop_process(&self, child: &mut Child) {
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!("redis-server on port {} already exited ({})", self.port, status);
                return;
            }
            Ok(None) => {}
            Err(e) => self.teardown_warning(&format!("failed to poll process: {e}")),
        }

        if let Err(e) = child.start_kill() {
            self.teardown_warning(&format!("failed to kill process: {e}"));
        }

        let grace = self.config.shutdown_timeout();
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("redis-server on port {} exited ({})", self.port, status);
            }
            Ok(Err(e)) => self.teardown_warning(&format!("failed to wait for exit: {e}")),
            Err(_) => self.teardown_warning(&format!("process did not exit within {grace:?}")),
        }
    }

    fn teardown_warning(&self, message: &str) {
        tracing::warn!("redis-server on port {}: {}", self.port, message);
        self.config
            .log_sink()
            .log(&format!("teardown warning: {message}"));
    }
}

impl Drop for RedisServer {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }

        tracing::warn!(
            "RedisServer on port {} dropped without shutdown(), killing process",
            self.port
        );

        self.capture.close();
        for reader in &self.readers {
            reader.abort();
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        // The temp copy and the port claim are released by their own Drop.
    }
}
