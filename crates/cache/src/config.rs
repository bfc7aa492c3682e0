//! Cache configuration: resource limits and backing-file locations.
//!
//! Configuration can be loaded from a file, environment variables, or created
//! programmatically. It feeds the default [`ResourceLimits`] governor and the
//! [`CacheContext`] every store is acquired in.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::resource::{ResourceGovernor, ResourceLimits};

const MB: u64 = 1024 * 1024;

/// Limit value meaning "no limit".
pub const UNLIMITED: u64 = u64::MAX;

/// Configuration for the pixel cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Largest single pixel array allowed in memory or mapped tiers, in bytes
    pub area_limit: u64,
    /// Heap memory budget across all caches, in bytes
    pub memory_limit: u64,
    /// Memory-mapped file budget across all caches, in bytes
    pub map_limit: u64,
    /// Disk budget across all caches, in bytes
    pub disk_limit: u64,
    /// Open cache file descriptors
    pub file_limit: u64,
    /// Wall-clock budget for the whole process
    pub time_limit: Option<Duration>,
    /// Directory for temporary cache files
    pub temporary_path: PathBuf,
    /// Back memory caches with anonymous maps instead of the heap
    pub anonymous_memory: bool,
    /// Nexus slots per store
    pub threads: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            area_limit: 3072 * MB,
            memory_limit: 1536 * MB,
            map_limit: 3072 * MB,
            disk_limit: UNLIMITED,
            file_limit: default_file_limit(),
            time_limit: None,
            temporary_path: std::env::temp_dir(),
            anonymous_memory: false,
            threads: num_cpus(),
        }
    }
}

impl CacheConfig {
    /// Sets the area limit in megabytes.
    pub fn with_area_mb(mut self, mb: u64) -> Self {
        self.area_limit = mb.saturating_mul(MB);
        self
    }

    /// Sets the heap memory limit in megabytes.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_limit = mb.saturating_mul(MB);
        self
    }

    /// Sets the memory-map limit in megabytes.
    pub fn with_map_mb(mut self, mb: u64) -> Self {
        self.map_limit = mb.saturating_mul(MB);
        self
    }

    /// Sets the disk limit in megabytes.
    pub fn with_disk_mb(mut self, mb: u64) -> Self {
        self.disk_limit = mb.saturating_mul(MB);
        self
    }

    pub fn with_file_limit(mut self, files: u64) -> Self {
        self.file_limit = files;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_temporary_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.temporary_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_anonymous_memory(mut self, anonymous: bool) -> Self {
        self.anonymous_memory = anonymous;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PIXEL_CACHE_AREA_MB`, `PIXEL_CACHE_MEMORY_MB`, `PIXEL_CACHE_MAP_MB`,
    ///   `PIXEL_CACHE_DISK_MB`: byte budgets in megabytes
    /// - `PIXEL_CACHE_FILES`: open cache file descriptors
    /// - `PIXEL_CACHE_TIME_SECS`: wall-clock limit in seconds
    /// - `PIXEL_CACHE_TEMPORARY_PATH`: directory for temporary cache files
    /// - `PIXEL_CACHE_ANONYMOUS_MEMORY`: `true`/`false`
    /// - `PIXEL_CACHE_THREADS`: nexus slots per store
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mb) = env_number("PIXEL_CACHE_AREA_MB")? {
            config = config.with_area_mb(mb);
        }
        if let Some(mb) = env_number("PIXEL_CACHE_MEMORY_MB")? {
            config = config.with_memory_mb(mb);
        }
        if let Some(mb) = env_number("PIXEL_CACHE_MAP_MB")? {
            config = config.with_map_mb(mb);
        }
        if let Some(mb) = env_number("PIXEL_CACHE_DISK_MB")? {
            config = config.with_disk_mb(mb);
        }
        if let Some(files) = env_number("PIXEL_CACHE_FILES")? {
            config.file_limit = files;
        }
        if let Some(secs) = env_number("PIXEL_CACHE_TIME_SECS")? {
            config.time_limit = Some(Duration::from_secs(secs));
        }
        if let Ok(val) = std::env::var("PIXEL_CACHE_TEMPORARY_PATH") {
            config.temporary_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PIXEL_CACHE_ANONYMOUS_MEMORY") {
            config.anonymous_memory = val.parse::<bool>().map_err(|_| {
                ConfigError::InvalidValue("PIXEL_CACHE_ANONYMOUS_MEMORY".to_string())
            })?;
        }
        if let Some(threads) = env_number("PIXEL_CACHE_THREADS")? {
            config = config.with_threads(threads as usize);
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (every key optional):
    /// ```toml
    /// area_mb = 3072
    /// memory_mb = 1536
    /// map_mb = 3072
    /// disk_mb = 10240
    /// files = 768
    /// time_secs = 3600
    /// temporary_path = "/var/tmp"
    /// anonymous_memory = false
    /// threads = 8
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();

        if let Some(mb) = file.area_mb {
            config = config.with_area_mb(mb);
        }
        if let Some(mb) = file.memory_mb {
            config = config.with_memory_mb(mb);
        }
        if let Some(mb) = file.map_mb {
            config = config.with_map_mb(mb);
        }
        if let Some(mb) = file.disk_mb {
            config = config.with_disk_mb(mb);
        }
        if let Some(files) = file.files {
            config.file_limit = files;
        }
        config.time_limit = file.time_secs.map(Duration::from_secs);
        if let Some(path) = file.temporary_path {
            config.temporary_path = path;
        }
        if let Some(anonymous) = file.anonymous_memory {
            config.anonymous_memory = anonymous;
        }
        if let Some(threads) = file.threads {
            config = config.with_threads(threads);
        }

        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format. Unlimited budgets are omitted.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let mb = |bytes: u64| (bytes != UNLIMITED).then_some(bytes / MB);
        let file = ConfigFile {
            area_mb: mb(self.area_limit),
            memory_mb: mb(self.memory_limit),
            map_mb: mb(self.map_limit),
            disk_mb: mb(self.disk_limit),
            files: Some(self.file_limit),
            time_secs: self.time_limit.map(|limit| limit.as_secs()),
            temporary_path: Some(self.temporary_path.clone()),
            anonymous_memory: Some(self.anonymous_memory),
            threads: Some(self.threads),
        };
        Ok(toml::to_string(&file)?)
    }
}

/// On-disk shape of [`CacheConfig`].
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    area_mb: Option<u64>,
    memory_mb: Option<u64>,
    map_mb: Option<u64>,
    disk_mb: Option<u64>,
    files: Option<u64>,
    time_secs: Option<u64>,
    temporary_path: Option<PathBuf>,
    anonymous_memory: Option<bool>,
    threads: Option<usize>,
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

fn env_number(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}

/// Get the number of logical CPU cores.
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(unix)]
fn default_file_limit() -> u64 {
    let mut limits = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we pass.
    let status = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) };
    if status != 0 || limits.rlim_cur == libc::RLIM_INFINITY {
        return 768;
    }
    (limits.rlim_cur as u64 * 3 / 4).clamp(16, 768)
}

#[cfg(not(unix))]
fn default_file_limit() -> u64 {
    768
}

/// Everything a store needs from its surroundings: the governor it draws budgets
/// from and where to put temporary files.
#[derive(Debug, Clone)]
pub struct CacheContext {
    pub governor: Arc<dyn ResourceGovernor>,
    pub temporary_path: PathBuf,
    pub anonymous_memory: bool,
    pub threads: usize,
}

static GLOBAL_CONTEXT: Lazy<CacheContext> = Lazy::new(|| {
    let config = CacheConfig::from_env().unwrap_or_else(|err| {
        log::warn!("ignoring pixel cache environment: {}", err);
        CacheConfig::default()
    });
    CacheContext::from_config(&config)
});

impl CacheContext {
    /// Builds a context with a fresh [`ResourceLimits`] governor.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            governor: Arc::new(ResourceLimits::new(config)),
            temporary_path: config.temporary_path.clone(),
            anonymous_memory: config.anonymous_memory,
            threads: config.threads.max(1),
        }
    }

    pub fn with_governor(config: &CacheConfig, governor: Arc<dyn ResourceGovernor>) -> Self {
        Self {
            governor,
            ..Self::from_config(config)
        }
    }

    /// The process-wide context, configured from the environment on first use.
    pub fn global() -> &'static CacheContext {
        &GLOBAL_CONTEXT
    }
}
