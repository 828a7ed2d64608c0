mod config;
mod console;
mod desktop;
mod error;
mod event_bridge;
mod host;
mod log_buffer;
mod presentation;
#[cfg(feature = "desktop")]
mod shell;
mod sidecar;
mod status;
mod supervisor;

pub use config::DesktopConfig;
pub use console::{ConsoleSubscriptions, LogConsole};
pub use desktop::DesktopContext;
pub use error::{ProcessError, ProcessResult};
pub use event_bridge::{EventBridge, EventHandler, Subscription};
pub use host::{
    BroadcastEmitter, EventEmitter, EventKind, HostEvent, ProcessHost, BACKEND_ERROR_EVENT,
    BACKEND_LOG_EVENT, BACKEND_TERMINATED_EVENT, GET_BACKEND_STATUS_COMMAND,
    RESTART_BACKEND_COMMAND, SHOW_LOGS_EVENT, START_BACKEND_COMMAND, STOP_BACKEND_COMMAND,
};
pub use log_buffer::{
    export_file_name, format_export_timestamp, parse_export_line, ExportedLine, LogAggregator,
    LogEntry, LogKind, LogSnapshot,
};
pub use presentation::{
    ControlAffordances, Indicator, PanelVisibility, ScrollState, AUTO_SCROLL_THRESHOLD,
};
#[cfg(feature = "desktop")]
pub use shell::{run, DesktopShellState, TauriEmitter};
pub use sidecar::{BackendHost, BackendLaunch};
pub use status::{reduce, RunState, StatusEvent, StatusReconciler};
pub use supervisor::ProcessSupervisor;
