//! Engine configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use questnet_runtime::config::EngineConfig;
//!
//! let config = EngineConfig::from_env()
//!     .quest_timeout(Duration::from_secs(2))
//!     .max_task_threads(16);
//! ```

pub mod defaults;

use std::time::Duration;

use questnet_core::env::{env_get, env_get_bool, env_get_ms};
use questnet_core::kinfo;

/// Engine configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connect deadline for new connections
    pub connect_timeout: Duration,
    /// Default answer deadline
    pub quest_timeout: Duration,
    /// Task pool workers alive at all times
    pub resident_task_threads: usize,
    /// Task pool ceiling
    pub max_task_threads: usize,
    /// Task pool queue bound
    pub task_queue_depth: usize,
    /// Registry capacity
    pub max_sockets: usize,
    /// Largest accepted frame
    pub max_package_len: usize,
    /// Timeout thread period
    pub tick_interval: Duration,
    /// Ignore SIGPIPE process-wide at engine start
    pub ignore_sigpipe: bool,
    /// Log every outgoing quest at info level
    pub log_client_quests: bool,
    /// Log every received answer at info level
    pub log_client_answers: bool,
    /// Keepalive for new TCP clients
    pub keepalive_by_default: bool,
    pub ping_interval: Duration,
    pub max_ping_retry: u32,
    pub udp_mtu: usize,
    pub udp_idle_limit: Duration,
    pub udp_heartbeat: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EngineConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `QNET_CONNECT_TIMEOUT_MS`, `QNET_QUEST_TIMEOUT_MS`
    /// - `QNET_RESIDENT_TASK_THREADS`, `QNET_MAX_TASK_THREADS`, `QNET_TASK_QUEUE_DEPTH`
    /// - `QNET_MAX_SOCKETS`, `QNET_MAX_PACKAGE_LEN`, `QNET_TICK_MS`
    /// - `QNET_IGNORE_SIGPIPE`, `QNET_LOG_QUESTS`, `QNET_LOG_ANSWERS` (0/1)
    /// - `QNET_KEEPALIVE` (0/1), `QNET_PING_INTERVAL_MS`, `QNET_MAX_PING_RETRY`
    /// - `QNET_UDP_MTU`, `QNET_UDP_IDLE_LIMIT_MS`, `QNET_UDP_HEARTBEAT_MS`
    pub fn from_env() -> Self {
        let d = Self::new();
        Self {
            connect_timeout: env_get_ms("QNET_CONNECT_TIMEOUT_MS", d.connect_timeout),
            quest_timeout: env_get_ms("QNET_QUEST_TIMEOUT_MS", d.quest_timeout),
            resident_task_threads: env_get("QNET_RESIDENT_TASK_THREADS", d.resident_task_threads),
            max_task_threads: env_get("QNET_MAX_TASK_THREADS", d.max_task_threads),
            task_queue_depth: env_get("QNET_TASK_QUEUE_DEPTH", d.task_queue_depth),
            max_sockets: env_get("QNET_MAX_SOCKETS", d.max_sockets),
            max_package_len: env_get("QNET_MAX_PACKAGE_LEN", d.max_package_len),
            tick_interval: env_get_ms("QNET_TICK_MS", d.tick_interval),
            ignore_sigpipe: env_get_bool("QNET_IGNORE_SIGPIPE", d.ignore_sigpipe),
            log_client_quests: env_get_bool("QNET_LOG_QUESTS", d.log_client_quests),
            log_client_answers: env_get_bool("QNET_LOG_ANSWERS", d.log_client_answers),
            keepalive_by_default: env_get_bool("QNET_KEEPALIVE", d.keepalive_by_default),
            ping_interval: env_get_ms("QNET_PING_INTERVAL_MS", d.ping_interval),
            max_ping_retry: env_get("QNET_MAX_PING_RETRY", d.max_ping_retry),
            udp_mtu: env_get("QNET_UDP_MTU", d.udp_mtu),
            udp_idle_limit: env_get_ms("QNET_UDP_IDLE_LIMIT_MS", d.udp_idle_limit),
            udp_heartbeat: env_get_ms("QNET_UDP_HEARTBEAT_MS", d.udp_heartbeat),
        }
    }

    /// Library defaults, no env override.
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            quest_timeout: Duration::from_millis(defaults::QUEST_TIMEOUT_MS),
            resident_task_threads: defaults::RESIDENT_TASK_THREADS,
            max_task_threads: defaults::MAX_TASK_THREADS,
            task_queue_depth: defaults::TASK_QUEUE_DEPTH,
            max_sockets: defaults::MAX_SOCKETS,
            max_package_len: defaults::MAX_PACKAGE_LEN,
            tick_interval: Duration::from_millis(defaults::TICK_MS),
            ignore_sigpipe: defaults::IGNORE_SIGPIPE,
            log_client_quests: defaults::LOG_CLIENT_QUESTS,
            log_client_answers: defaults::LOG_CLIENT_ANSWERS,
            keepalive_by_default: defaults::KEEPALIVE,
            ping_interval: Duration::from_millis(defaults::PING_INTERVAL_MS),
            max_ping_retry: defaults::MAX_PING_RETRY,
            udp_mtu: defaults::UDP_MTU,
            udp_idle_limit: Duration::from_millis(defaults::UDP_IDLE_LIMIT_MS),
            udp_heartbeat: Duration::from_millis(defaults::UDP_HEARTBEAT_MS),
        }
    }

    // Builder methods

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn quest_timeout(mut self, d: Duration) -> Self {
        self.quest_timeout = d;
        self
    }

    pub fn resident_task_threads(mut self, n: usize) -> Self {
        self.resident_task_threads = n;
        self
    }

    pub fn max_task_threads(mut self, n: usize) -> Self {
        self.max_task_threads = n;
        self
    }

    pub fn task_queue_depth(mut self, n: usize) -> Self {
        self.task_queue_depth = n;
        self
    }

    pub fn max_sockets(mut self, n: usize) -> Self {
        self.max_sockets = n;
        self
    }

    pub fn max_package_len(mut self, n: usize) -> Self {
        self.max_package_len = n;
        self
    }

    pub fn tick_interval(mut self, d: Duration) -> Self {
        self.tick_interval = d;
        self
    }

    pub fn ignore_sigpipe(mut self, enable: bool) -> Self {
        self.ignore_sigpipe = enable;
        self
    }

    pub fn log_client_quests(mut self, enable: bool) -> Self {
        self.log_client_quests = enable;
        self
    }

    pub fn log_client_answers(mut self, enable: bool) -> Self {
        self.log_client_answers = enable;
        self
    }

    pub fn keepalive_by_default(mut self, enable: bool) -> Self {
        self.keepalive_by_default = enable;
        self
    }

    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.ping_interval = d;
        self
    }

    pub fn max_ping_retry(mut self, n: u32) -> Self {
        self.max_ping_retry = n;
        self
    }

    pub fn udp_mtu(mut self, n: usize) -> Self {
        self.udp_mtu = n;
        self
    }

    pub fn udp_idle_limit(mut self, d: Duration) -> Self {
        self.udp_idle_limit = d;
        self
    }

    pub fn udp_heartbeat(mut self, d: Duration) -> Self {
        self.udp_heartbeat = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resident_task_threads == 0 {
            return Err(ConfigError::InvalidValue("resident_task_threads must be > 0"));
        }
        if self.max_task_threads < self.resident_task_threads {
            return Err(ConfigError::InvalidValue(
                "max_task_threads must be >= resident_task_threads",
            ));
        }
        if self.task_queue_depth == 0 {
            return Err(ConfigError::InvalidValue("task_queue_depth must be > 0"));
        }
        if self.max_sockets == 0 {
            return Err(ConfigError::InvalidValue("max_sockets must be > 0"));
        }
        if self.max_package_len < 64 {
            return Err(ConfigError::InvalidValue("max_package_len must be >= 64"));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue("tick_interval must be > 0"));
        }
        if self.quest_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("quest_timeout must be > 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("connect_timeout must be > 0"));
        }
        if self.max_ping_retry == 0 {
            return Err(ConfigError::InvalidValue("max_ping_retry must be > 0"));
        }
        if self.udp_mtu < 64 || self.udp_mtu > 65_507 {
            return Err(ConfigError::InvalidValue("udp_mtu must be within 64..=65507"));
        }
        Ok(())
    }

    /// Log the configuration at info level.
    pub fn print(&self) {
        kinfo!("questnet engine configuration:");
        kinfo!("  connect_timeout:        {:?}", self.connect_timeout);
        kinfo!("  quest_timeout:          {:?}", self.quest_timeout);
        kinfo!("  resident_task_threads:  {}", self.resident_task_threads);
        kinfo!("  max_task_threads:       {}", self.max_task_threads);
        kinfo!("  task_queue_depth:       {}", self.task_queue_depth);
        kinfo!("  max_sockets:            {}", self.max_sockets);
        kinfo!("  max_package_len:        {}", self.max_package_len);
        kinfo!("  tick_interval:          {:?}", self.tick_interval);
        kinfo!("  ignore_sigpipe:         {}", self.ignore_sigpipe);
        kinfo!("  log_client_quests:      {}", self.log_client_quests);
        kinfo!("  log_client_answers:     {}", self.log_client_answers);
        kinfo!("  keepalive_by_default:   {}", self.keepalive_by_default);
        kinfo!("  ping_interval:          {:?}", self.ping_interval);
        kinfo!("  max_ping_retry:         {}", self.max_ping_retry);
        kinfo!("  udp_mtu:                {}", self.udp_mtu);
        kinfo!("  udp_idle_limit:         {:?}", self.udp_idle_limit);
        kinfo!("  udp_heartbeat:          {:?}", self.udp_heartbeat);
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for questnet_core::NetError {
    fn from(e: ConfigError) -> Self {
        questnet_core::NetError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_package_len, 8 * 1024 * 1024);
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.max_ping_retry, 3);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("QNET_MAX_SOCKETS", "17");
        std::env::set_var("QNET_QUEST_TIMEOUT_MS", "1500");
        let config = EngineConfig::from_env();
        assert_eq!(config.max_sockets, 17);
        assert_eq!(config.quest_timeout, Duration::from_millis(1500));
        std::env::remove_var("QNET_MAX_SOCKETS");
        std::env::remove_var("QNET_QUEST_TIMEOUT_MS");
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .max_task_threads(8)
            .tick_interval(Duration::from_millis(20))
            .ignore_sigpipe(false);
        assert_eq!(config.max_task_threads, 8);
        assert_eq!(config.tick_interval, Duration::from_millis(20));
        assert!(!config.ignore_sigpipe);
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::new().resident_task_threads(0).validate().is_err());
        assert!(EngineConfig::new()
            .resident_task_threads(8)
            .max_task_threads(4)
            .validate()
            .is_err());
        assert!(EngineConfig::new().max_sockets(0).validate().is_err());
        assert!(EngineConfig::new().udp_mtu(70_000).validate().is_err());
        let err = EngineConfig::new().tick_interval(Duration::ZERO).validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid config: tick_interval must be > 0");
    }
}
