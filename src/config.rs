//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `MODEMWATCH_API_KEY`, `MODEMWATCH_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `modemwatch.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:1339"
//! data_dir = "/var/lib/modemwatch"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [asterisk]
//! cli = "asterisk"
//! service = "asterisk"
//! channel_module = "chan_quectel"
//! smsdb_dir = "/var/lib/asterisk/smsdb"
//! reboot_log = "/var/log/modemwatch-reboot.log"
//!
//! [watchdog]
//! enabled = true
//! check_interval_ms = 60000
//!
//! [watchdog.thresholds]
//! max_consecutive_failures = 3
//! min_rssi = 5
//!
//! [watchdog.enabled_levels]
//! maximum = false          # forbid host reboot on this box
//!
//! [[modems]]
//! id = "modem-1"
//! modem_type = "ec25"
//! data_port = "/dev/ttyUSB2"
//! volte_enabled = true
//! phone_number = "+15550001111"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::watchdog::Level;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub asterisk: AsteriskConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Supervised modem fleet. The watchdog is inert when empty.
    #[serde(default)]
    pub modems: Vec<ModemConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:1339`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for persistent data (action log). Default `/var/lib/modemwatch`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `MODEMWATCH_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// How to reach the telephony engine and the host around it.
#[derive(Debug, Clone, Deserialize)]
pub struct AsteriskConfig {
    /// Engine CLI binary, invoked as `<cli> -rx "<command>"`.
    #[serde(default = "default_asterisk_cli")]
    pub cli: String,
    /// systemd unit restarted at the CRITICAL level.
    #[serde(default = "default_asterisk_service")]
    pub service: String,
    /// Channel driver module reloaded at the HARD level.
    #[serde(default = "default_channel_module")]
    pub channel_module: String,
    /// Hard timeout for each CLI invocation.
    #[serde(default = "default_cli_timeout_ms")]
    pub cli_timeout_ms: u64,
    /// Directory where the engine keeps transient SMS bookkeeping files.
    #[serde(default = "default_smsdb_dir")]
    pub smsdb_dir: String,
    /// File receiving one `[timestamp] reason` line per host reboot.
    #[serde(default = "default_reboot_log")]
    pub reboot_log: String,
}

/// Watchdog behavior. Mutable at runtime through `reconfigure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Start supervising at boot (default true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Health-check period (default 60 000 ms).
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub cooldowns: Cooldowns,
    #[serde(default)]
    pub max_attempts: MaxAttempts,
    #[serde(default)]
    pub enabled_levels: EnabledLevels,
    /// Action log size cap before rotation (default 5 MiB).
    #[serde(default = "default_log_max_size_bytes")]
    pub log_max_size_bytes: u64,
    /// In-memory recent-action ring capacity (default 100).
    #[serde(default = "default_log_max_memory_entries")]
    pub log_max_memory_entries: usize,
}

/// Problem detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    /// Consecutive failed checks before any action (default 3).
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// RSSI below this (but above 0) is a weak signal (default 5).
    #[serde(default = "default_min_rssi")]
    pub min_rssi: i32,
    /// Minutes of RSSI 0 before NO_SIGNAL fires (default 5).
    #[serde(default = "default_max_no_signal_minutes")]
    pub max_no_signal_minutes: u64,
    /// Minutes stuck initializing before NOT_INIT fires (default 2).
    #[serde(default = "default_max_not_init_minutes")]
    pub max_not_init_minutes: u64,
    /// Minutes unregistered / providerless before acting (default 3).
    #[serde(default = "default_max_no_provider_minutes")]
    pub max_no_provider_minutes: u64,
    /// SMS spool file count that triggers cleanup (default 1000).
    #[serde(default = "default_smsdb_max_messages")]
    pub smsdb_max_messages: usize,
}

/// Per-level minimum delay between two dispatches, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cooldowns {
    #[serde(default = "default_cooldown_soft")]
    pub soft: u64,
    #[serde(default = "default_cooldown_medium")]
    pub medium: u64,
    #[serde(default = "default_cooldown_hard")]
    pub hard: u64,
    #[serde(default = "default_cooldown_critical")]
    pub critical: u64,
    #[serde(default = "default_cooldown_maximum")]
    pub maximum: u64,
}

/// Per-level attempt budget before escalating to the next level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxAttempts {
    #[serde(default = "default_attempts_soft")]
    pub soft: u32,
    #[serde(default = "default_attempts_medium")]
    pub medium: u32,
    #[serde(default = "default_attempts_hard")]
    pub hard: u32,
    #[serde(default = "default_attempts_critical")]
    pub critical: u32,
    #[serde(default = "default_attempts_maximum")]
    pub maximum: u32,
}

/// Which levels may dispatch. Disabling `maximum` forbids host reboots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnabledLevels {
    #[serde(default = "default_true")]
    pub soft: bool,
    #[serde(default = "default_true")]
    pub medium: bool,
    #[serde(default = "default_true")]
    pub hard: bool,
    #[serde(default = "default_true")]
    pub critical: bool,
    #[serde(default = "default_true")]
    pub maximum: bool,
}

/// Modem hardware flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModemType {
    Ec25,
    Sim7600,
}

/// One supervised modem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Stable device name as registered with the engine (e.g. `modem-1`).
    pub id: String,
    #[serde(default = "default_modem_type")]
    pub modem_type: ModemType,
    /// Serial device path for direct AT access (e.g. `/dev/ttyUSB2`).
    pub data_port: String,
    #[serde(default)]
    pub volte_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

/// Partial watchdog config for `reconfigure` / `PUT /api/watchdog/config`.
/// Present sub-tables replace their counterparts wholesale.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchdogUpdate {
    pub enabled: Option<bool>,
    pub check_interval_ms: Option<u64>,
    pub thresholds: Option<Thresholds>,
    pub cooldowns: Option<Cooldowns>,
    pub max_attempts: Option<MaxAttempts>,
    pub enabled_levels: Option<EnabledLevels>,
}

fn default_listen() -> String {
    "0.0.0.0:1339".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/modemwatch".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_asterisk_cli() -> String {
    "asterisk".to_string()
}
fn default_asterisk_service() -> String {
    "asterisk".to_string()
}
fn default_channel_module() -> String {
    "chan_quectel".to_string()
}
fn default_cli_timeout_ms() -> u64 {
    10_000
}
fn default_smsdb_dir() -> String {
    "/var/lib/asterisk/smsdb".to_string()
}
fn default_reboot_log() -> String {
    "/var/log/modemwatch-reboot.log".to_string()
}
fn default_enabled() -> bool {
    true
}
fn default_check_interval_ms() -> u64 {
    60_000
}
fn default_log_max_size_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_log_max_memory_entries() -> usize {
    100
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_min_rssi() -> i32 {
    5
}
fn default_max_no_signal_minutes() -> u64 {
    5
}
fn default_max_not_init_minutes() -> u64 {
    2
}
fn default_max_no_provider_minutes() -> u64 {
    3
}
fn default_smsdb_max_messages() -> usize {
    1000
}
fn default_cooldown_soft() -> u64 {
    30_000
}
fn default_cooldown_medium() -> u64 {
    120_000
}
fn default_cooldown_hard() -> u64 {
    300_000
}
fn default_cooldown_critical() -> u64 {
    600_000
}
fn default_cooldown_maximum() -> u64 {
    1_800_000
}
fn default_attempts_soft() -> u32 {
    3
}
fn default_attempts_medium() -> u32 {
    2
}
fn default_attempts_hard() -> u32 {
    2
}
fn default_attempts_critical() -> u32 {
    1
}
fn default_attempts_maximum() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_modem_type() -> ModemType {
    ModemType::Ec25
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AsteriskConfig {
    fn default() -> Self {
        Self {
            cli: default_asterisk_cli(),
            service: default_asterisk_service(),
            channel_module: default_channel_module(),
            cli_timeout_ms: default_cli_timeout_ms(),
            smsdb_dir: default_smsdb_dir(),
            reboot_log: default_reboot_log(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            check_interval_ms: default_check_interval_ms(),
            thresholds: Thresholds::default(),
            cooldowns: Cooldowns::default(),
            max_attempts: MaxAttempts::default(),
            enabled_levels: EnabledLevels::default(),
            log_max_size_bytes: default_log_max_size_bytes(),
            log_max_memory_entries: default_log_max_memory_entries(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            min_rssi: default_min_rssi(),
            max_no_signal_minutes: default_max_no_signal_minutes(),
            max_not_init_minutes: default_max_not_init_minutes(),
            max_no_provider_minutes: default_max_no_provider_minutes(),
            smsdb_max_messages: default_smsdb_max_messages(),
        }
    }
}

impl Default for Cooldowns {
    fn default() -> Self {
        Self {
            soft: default_cooldown_soft(),
            medium: default_cooldown_medium(),
            hard: default_cooldown_hard(),
            critical: default_cooldown_critical(),
            maximum: default_cooldown_maximum(),
        }
    }
}

impl Default for MaxAttempts {
    fn default() -> Self {
        Self {
            soft: default_attempts_soft(),
            medium: default_attempts_medium(),
            hard: default_attempts_hard(),
            critical: default_attempts_critical(),
            maximum: default_attempts_maximum(),
        }
    }
}

impl Default for EnabledLevels {
    fn default() -> Self {
        Self {
            soft: true,
            medium: true,
            hard: true,
            critical: true,
            maximum: true,
        }
    }
}

impl WatchdogConfig {
    /// Cooldown for one level. NONE never dispatches, so it has none.
    #[must_use]
    pub fn cooldown_ms(&self, level: Level) -> u64 {
        match level {
            Level::None => 0,
            Level::Soft => self.cooldowns.soft,
            Level::Medium => self.cooldowns.medium,
            Level::Hard => self.cooldowns.hard,
            Level::Critical => self.cooldowns.critical,
            Level::Maximum => self.cooldowns.maximum,
        }
    }

    /// Attempt budget for one level. NONE has a zero budget so the first
    /// escalation decision always moves to SOFT.
    #[must_use]
    pub fn max_attempts(&self, level: Level) -> u32 {
        match level {
            Level::None => 0,
            Level::Soft => self.max_attempts.soft,
            Level::Medium => self.max_attempts.medium,
            Level::Hard => self.max_attempts.hard,
            Level::Critical => self.max_attempts.critical,
            Level::Maximum => self.max_attempts.maximum,
        }
    }

    #[must_use]
    pub fn level_enabled(&self, level: Level) -> bool {
        match level {
            Level::None => false,
            Level::Soft => self.enabled_levels.soft,
            Level::Medium => self.enabled_levels.medium,
            Level::Hard => self.enabled_levels.hard,
            Level::Critical => self.enabled_levels.critical,
            Level::Maximum => self.enabled_levels.maximum,
        }
    }

    /// Merge a partial update. Returns true when the check interval changed
    /// (the running ticker must be re-armed).
    pub fn apply(&mut self, update: &WatchdogUpdate) -> bool {
        let old_interval = self.check_interval_ms;
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(interval) = update.check_interval_ms {
            self.check_interval_ms = interval;
        }
        if let Some(t) = &update.thresholds {
            self.thresholds = t.clone();
        }
        if let Some(c) = &update.cooldowns {
            self.cooldowns = c.clone();
        }
        if let Some(m) = &update.max_attempts {
            self.max_attempts = m.clone();
        }
        if let Some(e) = &update.enabled_levels {
            self.enabled_levels = e.clone();
        }
        self.check_interval_ms != old_interval
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `modemwatch.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("modemwatch.toml").exists() {
            let content =
                std::fs::read_to_string("modemwatch.toml").expect("Failed to read modemwatch.toml");
            toml::from_str(&content).expect("Failed to parse modemwatch.toml")
        } else {
            toml::from_str("").expect("defaults always deserialize")
        };

        // Env var overrides
        if let Ok(key) = std::env::var("MODEMWATCH_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("MODEMWATCH_LISTEN") {
            config.server.listen = listen;
        }

        config
    }

    /// Sanity-check the loaded configuration. Returns human-readable errors;
    /// an empty vec means the config is usable.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.watchdog.check_interval_ms < 1000 {
            errors.push(format!(
                "watchdog.check_interval_ms must be at least 1000, got {}",
                self.watchdog.check_interval_ms
            ));
        }
        if self.watchdog.log_max_size_bytes == 0 {
            errors.push("watchdog.log_max_size_bytes must be non-zero".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for modem in &self.modems {
            if modem.id.trim().is_empty() {
                errors.push("modem id must not be empty".to_string());
            }
            if !seen.insert(&modem.id) {
                errors.push(format!("duplicate modem id '{}'", modem.id));
            }
            if modem.data_port.trim().is_empty() {
                errors.push(format!("modem '{}' has an empty data_port", modem.id));
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.watchdog.check_interval_ms, 60_000);
        assert_eq!(cfg.watchdog.thresholds.max_consecutive_failures, 3);
        assert_eq!(cfg.watchdog.cooldowns.soft, 30_000);
        assert_eq!(cfg.watchdog.max_attempts.critical, 1);
        assert!(cfg.watchdog.enabled_levels.maximum);
        assert!(cfg.modems.is_empty());
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_full_toml_round_trip() {
        let cfg: Config = toml::from_str(
            r#"
            [watchdog]
            check_interval_ms = 30000

            [watchdog.enabled_levels]
            maximum = false

            [[modems]]
            id = "modem-1"
            modem_type = "sim7600"
            data_port = "/dev/ttyUSB2"
            volte_enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.watchdog.check_interval_ms, 30_000);
        assert!(!cfg.watchdog.enabled_levels.maximum);
        assert_eq!(cfg.modems.len(), 1);
        assert_eq!(cfg.modems[0].modem_type, ModemType::Sim7600);
        assert!(cfg.modems[0].volte_enabled);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_fast_intervals() {
        let cfg: Config = toml::from_str(
            r#"
            [watchdog]
            check_interval_ms = 10

            [[modems]]
            id = "modem-1"
            data_port = "/dev/ttyUSB2"

            [[modems]]
            id = "modem-1"
            data_port = ""
            "#,
        )
        .unwrap();
        let errors = cfg.validate();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_apply_reports_interval_change() {
        let mut cfg = WatchdogConfig::default();
        let update = WatchdogUpdate {
            check_interval_ms: Some(15_000),
            ..Default::default()
        };
        assert!(cfg.apply(&update));
        assert_eq!(cfg.check_interval_ms, 15_000);
        assert!(!cfg.apply(&update));
    }

    #[test]
    fn test_per_level_lookups() {
        let cfg = WatchdogConfig::default();
        assert_eq!(cfg.cooldown_ms(Level::Soft), 30_000);
        assert_eq!(cfg.cooldown_ms(Level::Maximum), 1_800_000);
        assert_eq!(cfg.max_attempts(Level::None), 0);
        assert_eq!(cfg.max_attempts(Level::Medium), 2);
        assert!(!cfg.level_enabled(Level::None));
        assert!(cfg.level_enabled(Level::Critical));
    }
}
