//! Disposable redis-server instances for integration tests.
//!
//! Each [`RedisServer`] owns one child process listening on `127.0.0.1`
//! and a port nobody else in this process holds. It is launched from a
//! private copy of a bundled executable, or from an installed redis-server.
//! `start` returns once the server prints its ready banner, and
//! `shutdown` kills the process and deletes the copy again.
//!
//! ```rust,no_run
//! use redis_fixture::RedisServer;
//!
//! # async fn example() -> redis_fixture::Result<()> {
//! let mut server = RedisServer::start_with(|c| c.use_external_binary(true)).await?;
//! let addr = server.endpoint(); // 127.0.0.1:<49152..=65535>
//! # let _ = addr;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executable;
pub mod port;
pub mod readiness;
pub mod server;
pub mod testing;

pub use config::{LogSink, ServerConfig, ServerConfigBuilder};
pub use error::{ConfigError, Error, ResolutionError, Result};
pub use executable::{BinaryBundle, DirectoryBundle, Platform, StaticBundle};
pub use port::{PortLease, PortRegistry};
pub use readiness::ReadinessDetector;
pub use server::RedisServer;
