//! Dispatcher configuration.
//!
//! Configuration can be built programmatically, loaded from environment
//! variables, or read from a TOML file.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lock::DEFAULT_LOCK_TIMEOUT;

/// Default stop timeout used when a dispatcher is dropped while running.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default worker thread name prefix.
pub const DEFAULT_THREAD_NAME: &str = "docpump-worker";

/// Configuration for a [`crate::Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Number of worker threads. 1 for resources that tolerate no concurrency.
    pub thread_count: usize,
    /// How long `Drop` waits for workers to exit
    pub stop_timeout: Duration,
    /// Timeout for the execution lock, when one is installed
    pub lock_timeout: Duration,
    /// Worker threads are named `<thread_name>-<index>`
    pub thread_name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

/// On-disk representation. Every key is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    thread_count: Option<usize>,
    stop_timeout_ms: Option<u64>,
    lock_timeout_ms: Option<u64>,
    thread_name: Option<String>,
}

impl DispatcherConfig {
    /// Creates a configuration with `thread_count` workers and default timeouts.
    pub fn new(thread_count: usize) -> Self {
        Self {
            thread_count,
            ..Self::default()
        }
    }

    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DOCPUMP_THREADS`: worker thread count (default: 1)
    /// - `DOCPUMP_STOP_TIMEOUT_MS`: stop timeout in milliseconds (default: 5000)
    /// - `DOCPUMP_LOCK_TIMEOUT_MS`: lock timeout in milliseconds (default: 30000)
    /// - `DOCPUMP_THREAD_NAME`: worker thread name prefix
    ///
    /// # Errors
    /// Returns an error if any variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_env()
    }

    /// Overrides fields of `self` with any `DOCPUMP_*` variables that are set.
    pub fn merge_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("DOCPUMP_THREADS") {
            self.thread_count = parse_thread_count("DOCPUMP_THREADS", &val)?;
        }

        if let Ok(val) = std::env::var("DOCPUMP_STOP_TIMEOUT_MS") {
            self.stop_timeout = parse_millis("DOCPUMP_STOP_TIMEOUT_MS", &val)?;
        }

        if let Ok(val) = std::env::var("DOCPUMP_LOCK_TIMEOUT_MS") {
            self.lock_timeout = parse_millis("DOCPUMP_LOCK_TIMEOUT_MS", &val)?;
        }

        if let Ok(val) = std::env::var("DOCPUMP_THREAD_NAME") {
            if val.trim().is_empty() {
                return Err(ConfigError::InvalidValue("DOCPUMP_THREAD_NAME".to_owned()));
            }
            self.thread_name = val;
        }

        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// thread_count = 1
    /// stop_timeout_ms = 5000
    /// lock_timeout_ms = 30000
    /// thread_name = "docpump-worker"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string. Missing keys keep their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();

        if let Some(thread_count) = file.thread_count {
            if thread_count == 0 {
                return Err(ConfigError::InvalidValue("thread_count".to_owned()));
            }
            config.thread_count = thread_count;
        }
        if let Some(ms) = file.stop_timeout_ms {
            config.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.lock_timeout_ms {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(name) = file.thread_name {
            config.thread_name = name;
        }

        Ok(config)
    }

    /// Serializes the configuration in the format read by [`DispatcherConfig::from_toml`].
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let file = ConfigFile {
            thread_count: Some(self.thread_count),
            stop_timeout_ms: Some(self.stop_timeout.as_millis() as u64),
            lock_timeout_ms: Some(self.lock_timeout.as_millis() as u64),
            thread_name: Some(self.thread_name.clone()),
        };
        Ok(toml::to_string(&file)?)
    }
}

fn parse_thread_count(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(ConfigError::InvalidValue(key.to_owned())),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue(key.to_owned()))
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_KEYS: [&str; 4] = [
        "DOCPUMP_THREADS",
        "DOCPUMP_STOP_TIMEOUT_MS",
        "DOCPUMP_LOCK_TIMEOUT_MS",
        "DOCPUMP_THREAD_NAME",
    ];

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.thread_count, 1);
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.thread_name, "docpump-worker");
    }

    #[test]
    fn test_builder_methods() {
        let config = DispatcherConfig::new(4)
            .with_stop_timeout(Duration::from_millis(250))
            .with_lock_timeout(Duration::from_secs(1))
            .with_thread_name("pdf");

        assert_eq!(config.thread_count, 4);
        assert_eq!(config.stop_timeout, Duration::from_millis(250));
        assert_eq!(config.lock_timeout, Duration::from_secs(1));
        assert_eq!(config.thread_name, "pdf");
        assert_eq!(config.with_thread_count(2).thread_count, 2);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ENV_KEYS);

        env::set_var("DOCPUMP_THREADS", "3");
        env::set_var("DOCPUMP_STOP_TIMEOUT_MS", "1500");
        env::set_var("DOCPUMP_LOCK_TIMEOUT_MS", "200");
        env::set_var("DOCPUMP_THREAD_NAME", "engine");

        let config = DispatcherConfig::from_env().unwrap();
        assert_eq!(config.thread_count, 3);
        assert_eq!(config.stop_timeout, Duration::from_millis(1500));
        assert_eq!(config.lock_timeout, Duration::from_millis(200));
        assert_eq!(config.thread_name, "engine");
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&ENV_KEYS);

        for key in ENV_KEYS {
            env::remove_var(key);
        }
        env::set_var("DOCPUMP_THREADS", "2");

        let config = DispatcherConfig::from_env().unwrap();
        assert_eq!(config.thread_count, 2);
        assert_eq!(config.stop_timeout, DEFAULT_STOP_TIMEOUT);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ENV_KEYS);

        env::set_var("DOCPUMP_THREADS", "0");
        assert!(matches!(
            DispatcherConfig::from_env(),
            Err(ConfigError::InvalidValue(key)) if key == "DOCPUMP_THREADS"
        ));

        env::set_var("DOCPUMP_THREADS", "1");
        env::set_var("DOCPUMP_STOP_TIMEOUT_MS", "soon");
        assert!(DispatcherConfig::from_env().is_err());
    }

    // Saves and restores environment variables around a test
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            # engine dispatcher
            thread_count = 2
            stop_timeout_ms = 750
            thread_name = "render"
        "#;

        let config = DispatcherConfig::from_toml(toml).unwrap();
        assert_eq!(config.thread_count, 2);
        assert_eq!(config.stop_timeout, Duration::from_millis(750));
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.thread_name, "render");
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys_and_zero_threads() {
        assert!(matches!(
            DispatcherConfig::from_toml("threads = 2"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            DispatcherConfig::from_toml("thread_count = 0"),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_toml_output_is_readable() {
        let config = DispatcherConfig::new(3).with_thread_name("io");
        let parsed = DispatcherConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.toml");
        fs::write(&path, "thread_count = 4\nlock_timeout_ms = 10\n").unwrap();

        let config = DispatcherConfig::from_file(&path).unwrap();
        assert_eq!(config.thread_count, 4);
        assert_eq!(config.lock_timeout, Duration::from_millis(10));

        let missing = DispatcherConfig::from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
