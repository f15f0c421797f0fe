//! Configuration types for the file watcher
//!
//! This module provides the configuration structure recognized by
//! [`FsWatcher`](crate::FsWatcher), its builder, TOML parsing and the
//! process-wide environment overrides for polling.

use crate::ignore::Matcher;
use config::{Config as ConfigSource, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tidewatch_core::{Error, Result};

/// Prefix of the environment overrides (`TIDEWATCH_USE_POLLING`, `TIDEWATCH_INTERVAL`)
pub const ENV_PREFIX: &str = "TIDEWATCH";

/// Delay before buffered unlinks are flushed in atomic mode
pub const DEFAULT_ATOMIC_DELAY_MS: u64 = 100;

/// Either a plain on/off switch or a detailed setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Toggle<T> {
    Enabled(bool),
    Custom(T),
}

/// Settings for holding add/change events until a file stops growing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitWriteFinish {
    /// Quiet time in milliseconds before a write counts as finished (default: 2000ms)
    #[serde(default = "default_stability_threshold_ms")]
    pub stability_threshold_ms: u64,
    /// Interval between size polls in milliseconds (default: 100ms)
    #[serde(default = "default_write_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_stability_threshold_ms() -> u64 {
    2000
}

fn default_write_poll_interval_ms() -> u64 {
    100
}

impl Default for AwaitWriteFinish {
    fn default() -> Self {
        Self {
            stability_threshold_ms: default_stability_threshold_ms(),
            poll_interval_ms: default_write_poll_interval_ms(),
        }
    }
}

impl AwaitWriteFinish {
    pub fn stability_threshold(&self) -> Duration {
        Duration::from_millis(self.stability_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration for the file watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Keep native subscriptions alive for the life of the process (default: true)
    ///
    /// Forwarded to the backend in every [`SubscribeOptions`](crate::SubscribeOptions).
    /// [`NotifyBackend`](crate::NotifyBackend) watches on its own threads and
    /// never holds the process open, so it accepts the flag and ignores it.
    pub persistent: bool,
    /// Patterns to ignore (glob patterns or literal paths)
    pub ignored: Vec<String>,
    /// Programmatic matchers (regex, predicates), not serialized
    #[serde(skip)]
    pub ignore_matchers: Vec<Matcher>,
    /// Suppress add/addDir events from the initial scan (default: false)
    pub ignore_initial: bool,
    /// Whether to follow symbolic links (default: true)
    pub follow_symlinks: bool,
    /// Base directory that emitted paths are relative to
    pub cwd: Option<PathBuf>,
    /// Use stat polling instead of native notifications (default: false)
    pub use_polling: bool,
    /// Polling interval in milliseconds (default: 100ms)
    pub interval_ms: u64,
    /// Polling interval for binary files in milliseconds (default: 300ms)
    pub binary_interval_ms: u64,
    /// Always attach stats to add/addDir/change events (default: false)
    pub always_stat: bool,
    /// Maximum recursion depth below each root (default: unbounded)
    pub depth: Option<u32>,
    /// Hold add/change events until writes finish (default: off)
    pub await_write_finish: Toggle<AwaitWriteFinish>,
    /// Treat permission errors like missing paths (default: false)
    pub ignore_permission_errors: bool,
    /// Collapse editor unlink+add pairs into change; `None` means "on unless polling"
    pub atomic: Option<Toggle<u64>>,
}

impl WatcherConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from builder
    pub fn builder() -> WatcherConfigBuilder {
        WatcherConfigBuilder::default()
    }

    /// Parse a configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("Failed to parse TOML: {e}")))
    }

    /// Get the polling interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get the polling interval for binary files
    pub fn binary_interval(&self) -> Duration {
        Duration::from_millis(self.binary_interval_ms)
    }

    /// Effective write-stability settings, if enabled
    pub fn await_write_finish(&self) -> Option<AwaitWriteFinish> {
        match self.await_write_finish {
            Toggle::Enabled(true) => Some(AwaitWriteFinish::default()),
            Toggle::Enabled(false) => None,
            Toggle::Custom(settings) => Some(settings),
        }
    }

    /// Effective atomic flush delay, if atomic mode is on
    pub fn atomic_delay(&self) -> Option<Duration> {
        match self.atomic {
            None => (!self.use_polling).then(|| Duration::from_millis(DEFAULT_ATOMIC_DELAY_MS)),
            Some(Toggle::Enabled(true)) => Some(Duration::from_millis(DEFAULT_ATOMIC_DELAY_MS)),
            Some(Toggle::Enabled(false)) => None,
            Some(Toggle::Custom(ms)) => Some(Duration::from_millis(ms)),
        }
    }

    /// Whether binary files get their own polling interval
    pub fn binary_interval_enabled(&self) -> bool {
        self.binary_interval_ms != self.interval_ms
    }

    /// Whether a traversal at `depth` may read the directory
    pub fn allows_depth(&self, depth: u32) -> bool {
        self.depth.is_none_or(|max| depth <= max)
    }

    /// Apply `TIDEWATCH_USE_POLLING` / `TIDEWATCH_INTERVAL` from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let overrides = EnvOverrides::from_environment(Environment::with_prefix(ENV_PREFIX))?;
        overrides.apply(self);
        Ok(())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 || self.binary_interval_ms == 0 {
            return Err(Error::config("Polling intervals must be greater than zero"));
        }
        if let Some(awf) = self.await_write_finish() {
            if awf.poll_interval_ms == 0 {
                return Err(Error::config(
                    "await_write_finish.poll_interval_ms must be greater than zero",
                ));
            }
        }
        if let Some(cwd) = &self.cwd {
            if cwd.as_os_str().is_empty() {
                return Err(Error::config("cwd must not be empty"));
            }
        }
        Ok(())
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            ignored: Vec::new(),
            ignore_matchers: Vec::new(),
            ignore_initial: false,
            follow_symlinks: true,
            cwd: None,
            use_polling: false,
            interval_ms: 100,
            binary_interval_ms: 300,
            always_stat: false,
            depth: None,
            await_write_finish: Toggle::Enabled(false),
            ignore_permission_errors: false,
            atomic: None,
        }
    }
}

/// Process-wide overrides read from the environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnvOverrides {
    pub use_polling: Option<String>,
    pub interval: Option<u64>,
}

impl EnvOverrides {
    /// Read overrides from an environment source
    pub fn from_environment(source: Environment) -> Result<Self> {
        ConfigSource::builder()
            .add_source(source.try_parsing(false))
            .build()
            .and_then(ConfigSource::try_deserialize::<EnvOverrides>)
            .map_err(|e| Error::config(format!("Failed to read environment overrides: {e}")))
    }

    /// Interpret `use_polling`: "false"/"0" turn it off, any other non-empty value on
    pub fn use_polling(&self) -> Option<bool> {
        let raw = self.use_polling.as_deref()?.trim().to_ascii_lowercase();
        match raw.as_str() {
            "" => None,
            "false" | "0" => Some(false),
            _ => Some(true),
        }
    }

    pub fn apply(&self, config: &mut WatcherConfig) {
        if let Some(use_polling) = self.use_polling() {
            config.use_polling = use_polling;
        }
        if let Some(interval) = self.interval.filter(|ms| *ms > 0) {
            config.interval_ms = interval;
        }
    }
}

/// Builder for WatcherConfig
#[derive(Debug, Default)]
pub struct WatcherConfigBuilder {
    config: WatcherConfig,
}

impl WatcherConfigBuilder {
    /// Set whether subscriptions are persistent
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.config.persistent = persistent;
        self
    }

    /// Set ignore patterns
    pub fn ignored(mut self, patterns: Vec<String>) -> Self {
        self.config.ignored = patterns;
        self
    }

    /// Add an ignore pattern
    pub fn add_ignored(mut self, pattern: impl Into<String>) -> Self {
        self.config.ignored.push(pattern.into());
        self
    }

    /// Add a programmatic ignore matcher
    pub fn ignore_matcher(mut self, matcher: Matcher) -> Self {
        self.config.ignore_matchers.push(matcher);
        self
    }

    /// Set whether initial scan events are suppressed
    pub fn ignore_initial(mut self, ignore: bool) -> Self {
        self.config.ignore_initial = ignore;
        self
    }

    /// Set whether to follow symlinks
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.config.follow_symlinks = follow;
        self
    }

    /// Set the base directory for emitted paths
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.config.cwd = Some(cwd.into());
        self
    }

    /// Set whether to poll instead of using native notifications
    pub fn use_polling(mut self, polling: bool) -> Self {
        self.config.use_polling = polling;
        self
    }

    /// Set polling interval in milliseconds
    pub fn interval_ms(mut self, ms: u64) -> Self {
        self.config.interval_ms = ms;
        self
    }

    /// Set binary polling interval in milliseconds
    pub fn binary_interval_ms(mut self, ms: u64) -> Self {
        self.config.binary_interval_ms = ms;
        self
    }

    /// Set whether stats are always attached
    pub fn always_stat(mut self, always: bool) -> Self {
        self.config.always_stat = always;
        self
    }

    /// Set recursion depth
    pub fn depth(mut self, depth: u32) -> Self {
        self.config.depth = Some(depth);
        self
    }

    /// Enable write-stability gating with default settings
    pub fn await_write_finish(mut self, enabled: bool) -> Self {
        self.config.await_write_finish = Toggle::Enabled(enabled);
        self
    }

    /// Enable write-stability gating with custom settings
    pub fn await_write_finish_with(mut self, stability_threshold_ms: u64, poll_interval_ms: u64) -> Self {
        self.config.await_write_finish = Toggle::Custom(AwaitWriteFinish {
            stability_threshold_ms,
            poll_interval_ms,
        });
        self
    }

    /// Set whether permission errors are ignored
    pub fn ignore_permission_errors(mut self, ignore: bool) -> Self {
        self.config.ignore_permission_errors = ignore;
        self
    }

    /// Turn atomic mode on or off
    pub fn atomic(mut self, enabled: bool) -> Self {
        self.config.atomic = Some(Toggle::Enabled(enabled));
        self
    }

    /// Turn atomic mode on with a custom flush delay in milliseconds
    pub fn atomic_delay_ms(mut self, ms: u64) -> Self {
        self.config.atomic = Some(Toggle::Custom(ms));
        self
    }

    /// Build the configuration
    pub fn build(self) -> WatcherConfig {
        self.config
    }
}
