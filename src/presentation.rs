use serde::Serialize;

use crate::status::RunState;

/// Distance from the bottom, in pixels, under which the view keeps following new entries.
pub const AUTO_SCROLL_THRESHOLD: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Indeterminate,
    Red,
    Green,
}

impl Indicator {
    pub fn for_state(state: RunState) -> Self {
        match state {
            RunState::Unknown => Self::Indeterminate,
            RunState::Stopped => Self::Red,
            RunState::Running => Self::Green,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Indeterminate => "Unknown",
            Self::Red => "Stopped",
            Self::Green => "Running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlAffordances {
    pub can_start: bool,
    pub can_stop: bool,
    pub can_restart: bool,
}

impl ControlAffordances {
    pub fn for_state(state: RunState) -> Self {
        let running = state.is_running();
        Self {
            can_start: !running,
            can_stop: running,
            can_restart: running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollState {
    auto_scroll: bool,
}

impl ScrollState {
    pub fn new() -> Self {
        Self { auto_scroll: true }
    }

    pub fn auto_scroll(&self) -> bool {
        self.auto_scroll
    }

    /// Scrolling up turns following off; coming back near the bottom turns it on again.
    pub fn on_scroll(&mut self, scroll_top: f64, scroll_height: f64, client_height: f64) -> bool {
        self.auto_scroll = scroll_height - scroll_top - client_height < AUTO_SCROLL_THRESHOLD;
        self.auto_scroll
    }

    pub fn should_scroll_to_bottom(&self) -> bool {
        self.auto_scroll
    }
}

impl Default for ScrollState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanelVisibility {
    #[default]
    Minimized,
    Expanded,
}

impl PanelVisibility {
    pub fn is_expanded(self) -> bool {
        self == Self::Expanded
    }

    pub fn show(&mut self) {
        *self = Self::Expanded;
    }

    pub fn minimize(&mut self) {
        *self = Self::Minimized;
    }
}
