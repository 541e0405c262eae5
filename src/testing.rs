//! Stand-in redis-server executables for exercising the fixture lifecycle.
//!
//! Provides:
//! - [`StubScript`]: builder for POSIX shell scripts that mimic the parts of
//!   redis-server the fixture cares about (banner lines, the ready marker,
//!   bind failures, crashes, hanging forever)
//!
//! # Usage
//!
//! ```rust,no_run
//! use redis_fixture::testing::StubScript;
//! use redis_fixture::{RedisServer, ServerConfig};
//!
//! # async fn example() -> redis_fixture::Result<()> {
//! let config = ServerConfig::builder()
//!     .bundle(StubScript::ready().bundle())
//!     .build()?;
//! let mut server = RedisServer::start(config).await?;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::executable::{Platform, StaticBundle};
use crate::readiness::DEFAULT_READY_MARKER;

/// Builder for a `/bin/sh` script that behaves like a (very small)
/// redis-server.
///
/// The script receives the real command line, so `$2` is the port.
#[derive(Debug, Clone)]
pub struct StubScript {
    lines: Vec<String>,
}

impl StubScript {
    /// Empty script: prints nothing and exits 0.
    pub fn new() -> Self {
        Self {
            lines: vec!["#!/bin/sh".to_string()],
        }
    }

    /// Prints its arguments and the ready marker, then stays up.
    pub fn ready() -> Self {
        Self::new()
            .echo_args()
            .stdout("# Server initialized")
            .ready_marker()
            .sleep_forever()
    }

    /// Stays up without ever becoming ready.
    pub fn silent() -> Self {
        Self::new().stdout("# Server initialized").sleep_forever()
    }

    /// Writes to stderr and exits with `code` before becoming ready.
    pub fn crashing(code: i32) -> Self {
        Self::new()
            .stderr("# Fatal error loading the configuration")
            .exit(code)
    }

    /// Reports the port as taken and exits like redis-server does.
    pub fn port_in_use() -> Self {
        Self::new()
            .raw(r##"echo "# Warning: Could not create server TCP listening socket 127.0.0.1:$2: bind: Address already in use""##)
            .exit(1)
    }

    /// Print a literal line on stdout.
    pub fn stdout(self, line: &str) -> Self {
        self.raw(format!("echo '{}'", escape_single_quoted(line)))
    }

    /// Print a literal line on stderr.
    pub fn stderr(self, line: &str) -> Self {
        self.raw(format!("echo '{}' >&2", escape_single_quoted(line)))
    }

    /// Print `args: <argv>` on stdout.
    pub fn echo_args(self) -> Self {
        self.raw(r#"echo "args: $*""#)
    }

    /// Print the default ready marker.
    pub fn ready_marker(self) -> Self {
        self.stdout(&format!("* {} tcp", DEFAULT_READY_MARKER))
    }

    /// Write the shell's pid to `path`. With [`sleep_forever`](Self::sleep_forever)
    /// this stays the pid of the running process.
    pub fn write_pid_to(self, path: &Path) -> Self {
        self.raw(format!(
            "echo $$ > '{}'",
            escape_single_quoted(&path.to_string_lossy())
        ))
    }

    /// Replace the shell with a long sleep so a kill hits the whole stub.
    pub fn sleep_forever(self) -> Self {
        self.raw("exec sleep 3600")
    }

    /// Exit the script with `code`.
    pub fn exit(self, code: i32) -> Self {
        self.raw(format!("exit {code}"))
    }

    /// Append a raw shell line.
    pub fn raw(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    /// The script text, newline terminated.
    pub fn render(&self) -> String {
        let mut script = self.lines.join("\n");
        script.push('\n');
        script
    }

    /// A bundle carrying this script under the host platform's key.
    pub fn bundle(&self) -> StaticBundle {
        let name = Platform::current()
            .map(|p| p.executable_name())
            .unwrap_or("redis-server");
        StaticBundle::new().with_bytes(name, self.render())
    }

    /// Write the script into `dir` as an executable `redis-server`.
    pub fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join("redis-server");
        std::fs::write(&path, self.render())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }

        Ok(path)
    }
}

impl Default for StubScript {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_single_quoted(s: &str) -> String {
    s.replace('\'', r#"'\''"#)
}
