use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{parse_flag, DesktopConfig};

/// Environment markers the desktop host sets for the processes it launches.
const HOST_RUNTIME_MARKERS: [&str; 2] = ["TAURI_ENV_PLATFORM", "OCTOPUS_DESKTOP"];

/// Probed "running inside the desktop host" capability, handed to every component
/// instead of being looked up globally.
#[derive(Debug, Clone)]
pub struct DesktopContext {
    available: Arc<AtomicBool>,
}

impl DesktopContext {
    pub fn desktop() -> Self {
        Self::with_flag(true)
    }

    pub fn browser() -> Self {
        Self::with_flag(false)
    }

    pub fn with_flag(available: bool) -> Self {
        Self {
            available: Arc::new(AtomicBool::new(available)),
        }
    }

    pub fn probe(config: &DesktopConfig) -> Self {
        Self::with_flag(probe_flag(config, |key| std::env::var(key).ok()))
    }

    /// Never blocks; a context that has not been probed yet reads as `false`.
    pub fn is_desktop_context(&self) -> bool {
        let available = self.available.load(Ordering::Acquire);
        log::debug!("[desktop] is_desktop_context={available}");
        available
    }

    /// Drops the capability for every clone of this context. The last known RunState
    /// is kept by its owner; it simply stops being acted upon.
    pub fn revoke(&self) {
        if self.available.swap(false, Ordering::AcqRel) {
            log::info!("[desktop] host capability revoked");
        }
    }
}

impl Default for DesktopContext {
    fn default() -> Self {
        Self::browser()
    }
}

fn probe_flag(config: &DesktopConfig, lookup: impl Fn(&str) -> Option<String>) -> bool {
    if let Some(forced) = config.desktop_mode {
        return forced;
    }

    if cfg!(feature = "desktop") {
        return true;
    }

    HOST_RUNTIME_MARKERS.iter().any(|marker| {
        lookup(marker)
            .map(|value| parse_flag(&value).unwrap_or(!value.trim().is_empty()))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_flag_wins_over_markers() {
        let config = DesktopConfig {
            desktop_mode: Some(false),
            ..DesktopConfig::default()
        };
        assert!(!probe_flag(&config, |_| Some("linux".to_string())));
    }

    #[test]
    fn marker_presence_enables_desktop_context() {
        if cfg!(feature = "desktop") {
            return;
        }
        let config = DesktopConfig::default();
        assert!(probe_flag(&config, |key| {
            (key == "TAURI_ENV_PLATFORM").then(|| "linux".to_string())
        }));
        assert!(!probe_flag(&config, |key| {
            (key == "OCTOPUS_DESKTOP").then(|| "0".to_string())
        }));
        assert!(!probe_flag(&config, |_| None));
    }

    #[test]
    fn revoking_is_visible_through_every_clone() {
        let context = DesktopContext::desktop();
        let shared = context.clone();
        assert!(shared.is_desktop_context());
        context.revoke();
        assert!(!shared.is_desktop_context());
    }
}
