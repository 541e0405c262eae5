//! Locating a runnable redis-server.
//!
//! Two modes, chosen by `ServerConfig::use_external_binary`:
//!
//! - **Bundled** (default): the platform entry of the configured
//!   [`BinaryBundle`] is copied to a fresh [`ScopedTempFile`] and marked
//!   executable. Every fixture runs its own private copy.
//! - **External**: an installed redis-server is used in place, either the
//!   configured `executable_path` or whatever `which`/`where` reports. The
//!   binary is validated but not copied, so nothing needs deleting later.

pub mod bundle;
pub mod temp_file;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::ServerConfig;
use crate::error::ResolutionError;

pub use bundle::{BinaryBundle, DirectoryBundle, StaticBundle};
pub use temp_file::ScopedTempFile;

/// Host platform, as far as redis-server builds are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
}

impl Platform {
    /// Detect the current platform.
    pub fn current() -> Result<Self, ResolutionError> {
        Self::from_os(std::env::consts::OS).ok_or_else(|| ResolutionError::UnsupportedPlatform {
            os: std::env::consts::OS.to_string(),
        })
    }

    /// Map a `std::env::consts::OS` value.
    pub fn from_os(os: &str) -> Option<Self> {
        match os {
            "macos" => Some(Platform::MacOS),
            "linux" | "freebsd" | "openbsd" | "netbsd" | "dragonfly" => Some(Platform::Linux),
            "windows" => Some(Platform::Windows),
            _ => None,
        }
    }

    /// Bundle key and PATH lookup name.
    pub fn executable_name(&self) -> &'static str {
        match self {
            Platform::Windows => "redis-server.exe",
            Platform::MacOS | Platform::Linux => "redis-server",
        }
    }

    /// Extension for extracted copies.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Platform::Windows => Some("exe"),
            Platform::MacOS | Platform::Linux => None,
        }
    }

    /// Standard command line for a server listening on loopback `port`.
    ///
    /// The Windows port of redis refuses to run without disk persistence
    /// unless told otherwise.
    pub fn server_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            port.to_string(),
            "--bind".to_string(),
            "127.0.0.1".to_string(),
        ];
        if *self == Platform::Windows {
            args.extend(["--persistence-available".to_string(), "no".to_string()]);
        }
        args
    }

    fn locate_command(&self) -> &'static str {
        match self {
            Platform::Windows => "where",
            Platform::MacOS | Platform::Linux => "which",
        }
    }
}

/// A runnable executable, plus the temp copy backing it in bundled mode.
#[derive(Debug)]
pub struct ResolvedExecutable {
    path: PathBuf,
    temp_file: Option<ScopedTempFile>,
}

impl ResolvedExecutable {
    /// Path to launch.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the executable is a private copy that is deleted on release.
    pub fn is_temporary(&self) -> bool {
        self.temp_file.is_some()
    }

    pub(crate) fn into_temp_file(self) -> Option<ScopedTempFile> {
        self.temp_file
    }
}

/// Turns a [`ServerConfig`] into a [`ResolvedExecutable`].
#[derive(Debug, Clone, Copy)]
pub struct ExecutableResolver {
    platform: Platform,
}

impl ExecutableResolver {
    /// Resolver for `platform`.
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// Resolver for the host platform.
    pub fn current() -> Result<Self, ResolutionError> {
        Ok(Self::new(Platform::current()?))
    }

    /// Platform whose executable name and lookup are used.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Find or extract the executable `config` asks for.
    pub fn resolve(&self, config: &ServerConfig) -> Result<ResolvedExecutable, ResolutionError> {
        if config.use_external_binary() {
            self.resolve_external(config)
        } else {
            self.resolve_bundled(config)
        }
    }

    fn resolve_bundled(&self, config: &ServerConfig) -> Result<ResolvedExecutable, ResolutionError> {
        let name = self.platform.executable_name();
        let source = config
            .bundle()
            .open(name)
            .ok_or_else(|| ResolutionError::MissingResource {
                name: name.to_string(),
            })?;

        let dir = config
            .temp_dir()
            .cloned()
            .unwrap_or_else(std::env::temp_dir);

        let extract_err = |e: std::io::Error| ResolutionError::Extract {
            reason: format!("{}: {}", dir.display(), e),
        };
        let temp_file = ScopedTempFile::create_from(&dir, "redis-server", self.platform.extension(), source)
            .map_err(extract_err)?;
        temp_file.make_executable().map_err(extract_err)?;

        tracing::debug!("Extracted bundled {} to {}", name, temp_file.path().display());

        Ok(ResolvedExecutable {
            path: temp_file.path().to_path_buf(),
            temp_file: Some(temp_file),
        })
    }

    fn resolve_external(&self, config: &ServerConfig) -> Result<ResolvedExecutable, ResolutionError> {
        let path = match config.executable_path() {
            Some(path) => path.clone(),
            None => self.locate_on_path(self.platform.executable_name())?,
        };

        validate_executable(&path)?;
        tracing::debug!("Using external redis-server at {}", path.display());

        Ok(ResolvedExecutable {
            path,
            temp_file: None,
        })
    }

    /// Ask `which`/`where` for `program`; first reported match wins.
    fn locate_on_path(&self, program: &str) -> Result<PathBuf, ResolutionError> {
        let not_found = || ResolutionError::NotOnPath {
            program: program.to_string(),
        };

        let output = Command::new(self.platform.locate_command())
            .arg(program)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| {
                tracing::debug!("{} unavailable: {}", self.platform.locate_command(), e);
                not_found()
            })?;

        if !output.status.success() {
            return Err(not_found());
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
            .ok_or_else(not_found)
    }
}

/// Check that `path` is an existing, readable regular file.
fn validate_executable(path: &Path) -> Result<(), ResolutionError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ResolutionError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ResolutionError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        }
    })?;

    if !metadata.is_file() {
        return Err(ResolutionError::Unreadable {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }

    File::open(path).map_err(|e| ResolutionError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(())
}
