use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub(crate) const DEFAULT_PRODUCT_NAME: &str = "octopus";
pub(crate) const DEFAULT_BACKEND_PROGRAM: &str = "octopus-server";
pub(crate) const DEFAULT_LOG_CAPACITY: usize = 1000;
const MIN_LOG_CAPACITY: usize = 1;
const MAX_LOG_CAPACITY: usize = 100_000;
const DEFAULT_STATUS_POLL_MS: u64 = 5_000;
const MIN_STATUS_POLL_MS: u64 = 100;
const MAX_STATUS_POLL_MS: u64 = 10 * 60 * 1000;
const DEFAULT_RESTART_SETTLE_MS: u64 = 500;
// Leaves the event pump time to deliver the old child's termination before the restart reply.
const MIN_RESTART_SETTLE_MS: u64 = 50;
const MAX_RESTART_SETTLE_MS: u64 = 30_000;
const DEFAULT_AUTO_START_DELAY_MS: u64 = 500;

const BACKEND_BIN_ENV: &str = "OCTOPUS_BACKEND_BIN";
const LOG_CAPACITY_ENV: &str = "OCTOPUS_LOG_CAPACITY";
const STATUS_POLL_ENV: &str = "OCTOPUS_STATUS_POLL_MS";
const RESTART_SETTLE_ENV: &str = "OCTOPUS_RESTART_SETTLE_MS";
const DESKTOP_MODE_ENV: &str = "OCTOPUS_DESKTOP_MODE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DesktopConfig {
    pub product_name: String,
    pub backend_program: String,
    pub backend_args: Vec<String>,
    pub backend_env: BTreeMap<String, String>,
    pub log_capacity: usize,
    pub status_poll_interval_ms: u64,
    pub restart_settle_delay_ms: u64,
    pub auto_start_delay_ms: u64,
    pub desktop_mode: Option<bool>,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        let mut backend_env = BTreeMap::new();
        backend_env.insert("OCTOPUS_CORS_ALLOW_ORIGINS".to_string(), "*".to_string());

        Self {
            product_name: DEFAULT_PRODUCT_NAME.to_string(),
            backend_program: DEFAULT_BACKEND_PROGRAM.to_string(),
            backend_args: vec!["start".to_string()],
            backend_env,
            log_capacity: DEFAULT_LOG_CAPACITY,
            status_poll_interval_ms: DEFAULT_STATUS_POLL_MS,
            restart_settle_delay_ms: DEFAULT_RESTART_SETTLE_MS,
            auto_start_delay_ms: DEFAULT_AUTO_START_DELAY_MS,
            desktop_mode: None,
        }
    }
}

impl DesktopConfig {
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Parses a JSON config document; missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        let parsed = serde_json::from_str::<Self>(raw)
            .map_err(|error| format!("Failed to parse desktop config: {error}"))?;
        Ok(parsed.normalized())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(program) = read(BACKEND_BIN_ENV) {
            self.backend_program = program;
        }
        if let Some(raw) = read(LOG_CAPACITY_ENV) {
            match raw.parse::<usize>() {
                Ok(capacity) => self.log_capacity = capacity,
                Err(_) => log::warn!("ignoring {LOG_CAPACITY_ENV}={raw}: not a number"),
            }
        }
        if let Some(raw) = read(STATUS_POLL_ENV) {
            match raw.parse::<u64>() {
                Ok(interval) => self.status_poll_interval_ms = interval,
                Err(_) => log::warn!("ignoring {STATUS_POLL_ENV}={raw}: not a number"),
            }
        }
        if let Some(raw) = read(RESTART_SETTLE_ENV) {
            match raw.parse::<u64>() {
                Ok(delay) => self.restart_settle_delay_ms = delay,
                Err(_) => log::warn!("ignoring {RESTART_SETTLE_ENV}={raw}: not a number"),
            }
        }
        if let Some(raw) = read(DESKTOP_MODE_ENV) {
            match parse_flag(&raw) {
                Some(flag) => self.desktop_mode = Some(flag),
                None => log::warn!("ignoring {DESKTOP_MODE_ENV}={raw}: expected a boolean"),
            }
        }

        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.log_capacity = self.log_capacity.clamp(MIN_LOG_CAPACITY, MAX_LOG_CAPACITY);
        self.status_poll_interval_ms = self
            .status_poll_interval_ms
            .clamp(MIN_STATUS_POLL_MS, MAX_STATUS_POLL_MS);
        self.restart_settle_delay_ms = self
            .restart_settle_delay_ms
            .clamp(MIN_RESTART_SETTLE_MS, MAX_RESTART_SETTLE_MS);
        if self.backend_program.trim().is_empty() {
            self.backend_program = DEFAULT_BACKEND_PROGRAM.to_string();
        }
        if self.product_name.trim().is_empty() {
            self.product_name = DEFAULT_PRODUCT_NAME.to_string();
        }
        self
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn restart_settle_delay(&self) -> Duration {
        Duration::from_millis(self.restart_settle_delay_ms)
    }

    pub fn auto_start_delay(&self) -> Duration {
        Duration::from_millis(self.auto_start_delay_ms)
    }
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
