//! Fixture lifecycle tests against stub servers.
//!
//! Every test launches a `/bin/sh` stand-in built by `StubScript`, so no
//! real redis-server is needed:
//! - ready stubs cover start, endpoint, argument passing and teardown
//! - silent, crashing and port-in-use stubs cover the startup failures
#![cfg(unix)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use redis_fixture::port::DYNAMIC_PORTS;
use redis_fixture::testing::StubScript;
use redis_fixture::{
    Error, PortRegistry, RedisServer, ResolutionError, ServerConfig, ServerConfigBuilder,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Log sink that records every line.
#[derive(Clone, Default)]
struct Lines(Arc<Mutex<Vec<String>>>);

impl Lines {
    fn sink(&self) -> impl Fn(&str) + Send + Sync + 'static {
        let lines = Arc::clone(&self.0);
        move |line| lines.lock().unwrap().push(line.to_string())
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn contains(&self, needle: &str) -> bool {
        self.snapshot().iter().any(|l| l.contains(needle))
    }
}

/// Private registry and temp dir per test, so assertions about leftovers
/// are not disturbed by tests running in parallel.
struct Sandbox {
    temp: TempDir,
    registry: Arc<PortRegistry>,
    lines: Lines,
}

impl Sandbox {
    fn new() -> Self {
        init_tracing();
        Self {
            temp: tempfile::tempdir().unwrap(),
            registry: Arc::new(PortRegistry::new()),
            lines: Lines::default(),
        }
    }

    fn config(&self, stub: &StubScript) -> ServerConfigBuilder {
        ServerConfig::builder()
            .bundle(stub.bundle())
            .temp_dir(self.temp.path())
            .port_registry(Arc::clone(&self.registry))
            .log_to(self.lines.sink())
    }

    fn temp_files(&self) -> usize {
        std::fs::read_dir(self.temp.path()).unwrap().count()
    }
}

/// Alive and not a zombie.
fn process_alive(pid: u32) -> bool {
    let Ok(output) = std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
    else {
        return false;
    };
    let stat = String::from_utf8_lossy(&output.stdout);
    let stat = stat.trim();
    output.status.success() && !stat.is_empty() && !stat.starts_with('Z')
}

async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

fn read_pid(path: &Path) -> u32 {
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

// ---------------------------------------------------------------------------
// Successful start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_starts_bundled_copy_on_random_port() {
    let sandbox = Sandbox::new();
    let config = sandbox.config(&StubScript::ready()).build().unwrap();

    let mut server = RedisServer::start(config).await.unwrap();
    let port = server.port();

    assert!(DYNAMIC_PORTS.contains(&port));
    assert_eq!(server.endpoint().to_string(), format!("127.0.0.1:{port}"));
    assert_eq!(server.connection_url(), format!("redis://127.0.0.1:{port}"));
    assert!(server.executable_path().starts_with(sandbox.temp.path()));
    assert!(server.executable_path().exists());
    assert!(server.is_running());
    assert!(sandbox.registry.is_claimed(port));
    assert!(
        sandbox
            .lines
            .contains(&format!("args: --port {port} --bind 127.0.0.1"))
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_explicit_port_and_extra_args_reach_the_process() {
    let sandbox = Sandbox::new();
    let config = sandbox
        .config(&StubScript::ready())
        .port(50123)
        .replica_of(50999)
        .build()
        .unwrap();

    let mut server = RedisServer::start(config).await.unwrap();

    assert_eq!(server.port(), 50123);
    assert!(
        sandbox
            .lines
            .contains("args: --port 50123 --bind 127.0.0.1 --replicaof 127.0.0.1 50999")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_custom_ready_marker() {
    let sandbox = Sandbox::new();
    let stub = StubScript::new().stdout("stub is go").sleep_forever();
    let config = sandbox
        .config(&stub)
        .ready_marker("IS GO")
        .build()
        .unwrap();

    let mut server = RedisServer::start(config).await.unwrap();
    assert!(server.is_running());
    server.shutdown().await;
}

#[tokio::test]
async fn test_stderr_lines_reach_the_log_sink() {
    let sandbox = Sandbox::new();
    let stub = StubScript::new()
        .stderr("# WARNING overcommit_memory is set to 0!")
        .ready_marker()
        .sleep_forever();

    let mut server = RedisServer::start(sandbox.config(&stub).build().unwrap())
        .await
        .unwrap();

    let lines = sandbox.lines.clone();
    assert!(eventually(Duration::from_secs(2), || lines.contains("overcommit_memory")).await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_external_executable_is_used_in_place() {
    let sandbox = Sandbox::new();
    let bin_dir = tempfile::tempdir().unwrap();
    let exe = StubScript::ready().write_to(bin_dir.path()).unwrap();

    let config = ServerConfig::builder()
        .executable_path(&exe)
        .temp_dir(sandbox.temp.path())
        .port_registry(Arc::clone(&sandbox.registry))
        .build()
        .unwrap();

    let mut server = RedisServer::start(config).await.unwrap();
    assert_eq!(server.executable_path(), exe.as_path());
    assert_eq!(sandbox.temp_files(), 0, "nothing extracted in external mode");

    server.shutdown().await;
    assert!(exe.exists(), "external binaries are never deleted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_servers_get_distinct_ports() {
    let sandbox = Sandbox::new();

    let starts = (0..8).map(|_| {
        let config = sandbox.config(&StubScript::ready()).build().unwrap();
        RedisServer::start(config)
    });
    let mut servers: Vec<RedisServer> = futures::future::join_all(starts)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let mut ports: Vec<u16> = servers.iter().map(RedisServer::port).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 8);
    assert_eq!(sandbox.registry.len(), 8);
    assert_eq!(sandbox.temp_files(), 8, "one private copy per server");

    for server in &mut servers {
        server.shutdown().await;
    }
    assert!(sandbox.registry.is_empty());
    assert_eq!(sandbox.temp_files(), 0);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let sandbox = Sandbox::new();
    let mut server = RedisServer::start(sandbox.config(&StubScript::ready()).build().unwrap())
        .await
        .unwrap();

    let pid = server.pid().unwrap();
    let port = server.port();
    let exe = server.executable_path().to_path_buf();
    assert!(process_alive(pid));

    server.shutdown().await;

    assert!(server.is_shut_down());
    assert!(!server.is_running());
    assert_eq!(server.pid(), None);
    assert!(!process_alive(pid), "process {pid} survived shutdown");
    assert!(!exe.exists(), "temp copy survived shutdown");
    assert!(!sandbox.registry.is_claimed(port));
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let sandbox = Sandbox::new();
    let mut server = RedisServer::start(sandbox.config(&StubScript::ready()).build().unwrap())
        .await
        .unwrap();

    server.shutdown().await;
    server.shutdown().await;
    server.shutdown().await;

    assert!(server.is_shut_down());
    assert!(
        !sandbox.lines.contains("teardown warning"),
        "repeated shutdown must be silent: {:?}",
        sandbox.lines.snapshot()
    );
}

#[tokio::test]
async fn test_drop_without_shutdown_still_cleans_up() {
    let sandbox = Sandbox::new();
    let server = RedisServer::start(sandbox.config(&StubScript::ready()).build().unwrap())
        .await
        .unwrap();

    let pid = server.pid().unwrap();
    let port = server.port();
    let exe = server.executable_path().to_path_buf();

    drop(server);

    assert!(eventually(Duration::from_secs(5), || !process_alive(pid)).await);
    assert!(!exe.exists());
    assert!(!sandbox.registry.is_claimed(port));
}

#[tokio::test]
async fn test_shutdown_after_process_died_is_quiet() {
    let sandbox = Sandbox::new();
    let mut server = RedisServer::start(sandbox.config(&StubScript::ready()).build().unwrap())
        .await
        .unwrap();

    let pid = server.pid().unwrap();
    std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || !server.is_running()).await);

    server.shutdown().await;
    assert!(server.is_shut_down());
    assert!(!sandbox.lines.contains("teardown warning"));
    assert_eq!(sandbox.temp_files(), 0);
}

// ---------------------------------------------------------------------------
// Startup failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_missing_ready_marker_times_out_and_unwinds() {
    let sandbox = Sandbox::new();
    let pid_dir = tempfile::tempdir().unwrap();
    let pid_path = pid_dir.path().join("stub.pid");
    let stub = StubScript::new()
        .write_pid_to(&pid_path)
        .stdout("# Server initialized")
        .sleep_forever();

    let config = sandbox
        .config(&stub)
        .startup_timeout(Duration::from_millis(300))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = RedisServer::start(config).await.unwrap_err();

    match err {
        Error::StartupTimeout { port, timeout } => {
            assert!(DYNAMIC_PORTS.contains(&port));
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("expected StartupTimeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    let pid = read_pid(&pid_path);
    assert!(!process_alive(pid), "stub {pid} left running after timeout");
    assert!(sandbox.registry.is_empty());
    assert_eq!(sandbox.temp_files(), 0);
}

#[tokio::test]
async fn test_early_exit_is_reported_with_output() {
    let sandbox = Sandbox::new();
    let config = sandbox.config(&StubScript::crashing(3)).build().unwrap();

    let err = RedisServer::start(config).await.unwrap_err();

    match err {
        Error::ProcessExited { status, output, .. } => {
            assert!(status.contains('3'), "status was {status}");
            assert!(output.iter().any(|l| l.contains("Fatal error")));
        }
        other => panic!("expected ProcessExited, got {other:?}"),
    }
    assert!(sandbox.registry.is_empty());
    assert_eq!(sandbox.temp_files(), 0);
}

#[tokio::test]
async fn test_exit_right_after_ready_is_a_start_error() {
    let sandbox = Sandbox::new();
    let stub = StubScript::new().ready_marker().exit(0);
    let config = sandbox.config(&stub).build().unwrap();

    let err = RedisServer::start(config).await.unwrap_err();

    match &err {
        Error::ProcessExited { status, output, .. } => {
            assert!(status.contains('0'), "status was {status}");
            assert!(output.iter().any(|l| l.contains("Ready to accept connections")));
        }
        other => panic!("expected ProcessExited, got {other:?}"),
    }
    assert!(sandbox.registry.is_empty());
    assert_eq!(sandbox.temp_files(), 0);
}

#[tokio::test]
async fn test_bind_failure_is_a_start_error() {
    let sandbox = Sandbox::new();
    let config = sandbox
        .config(&StubScript::port_in_use())
        .port(50321)
        .build()
        .unwrap();

    let err = RedisServer::start(config).await.unwrap_err();

    match &err {
        Error::BindOrStart { port, reason } => {
            assert_eq!(*port, 50321);
            assert!(
                reason.contains("Address already in use"),
                "reason was {reason}"
            );
        }
        other => panic!("expected BindOrStart, got {other:?}"),
    }
    assert!(err.is_startup_failure());
    assert!(!sandbox.registry.is_claimed(50321));
}

#[tokio::test]
async fn test_second_server_on_same_port_fails_and_first_survives() {
    let sandbox = Sandbox::new();
    let port = 50377;
    let mut first = RedisServer::start(
        sandbox
            .config(&StubScript::ready())
            .port(port)
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    let err = RedisServer::start(
        sandbox
            .config(&StubScript::port_in_use())
            .port(port)
            .build()
            .unwrap(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::BindOrStart { port: p, .. } if p == port), "got {err:?}");
    assert!(first.is_running());
    assert_eq!(first.port(), port);
    assert!(sandbox.registry.is_claimed(port));
    assert_eq!(sandbox.temp_files(), 1);

    first.shutdown().await;
    assert!(!sandbox.registry.is_claimed(port));
    assert_eq!(sandbox.temp_files(), 0);
}

#[tokio::test]
async fn test_missing_bundle_entry_fails_before_spawning() {
    let sandbox = Sandbox::new();
    let config = ServerConfig::builder()
        .temp_dir(sandbox.temp.path())
        .port_registry(Arc::clone(&sandbox.registry))
        .build()
        .unwrap();

    let err = RedisServer::start(config).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Resolution(ResolutionError::MissingResource { .. })
    ));
    assert!(sandbox.registry.is_empty());
    assert_eq!(sandbox.temp_files(), 0);
}

#[tokio::test]
async fn test_unexecutable_file_is_a_start_error() {
    let sandbox = Sandbox::new();
    let bin_dir = tempfile::tempdir().unwrap();
    let exe = bin_dir.path().join("redis-server");
    std::fs::write(&exe, b"not a program").unwrap();

    let config = ServerConfig::builder()
        .executable_path(&exe)
        .port_registry(Arc::clone(&sandbox.registry))
        .build()
        .unwrap();

    let err = RedisServer::start(config).await.unwrap_err();
    assert!(matches!(err, Error::BindOrStart { .. }), "got {err:?}");
    assert!(sandbox.registry.is_empty());
}
